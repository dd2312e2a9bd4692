//! Expression engine: tokenizer, shunting-yard conversion, postfix
//! evaluation, and the simulated per-operator cost model.
//!
//! All five operators are treated as left-associative, including `^`.
//! That deviates from the usual right-associative exponentiation and is
//! intentional; see the `caret_is_left_associative` test.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use crate::error::{Error, Result};
use crate::model::CostTable;

/// Characters a submission may contain. Checked before any dispatch.
static CHARSET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9()+\-*/^.]+$").expect("charset regex"));

/// Shape of a numeric literal token.
static NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]+(\.[0-9]+)?$").expect("number regex"));

/// One lexical unit of an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// A digit/`.` run, still unparsed. Parsed to f64 at evaluation time.
    Number(String),
    /// One of `+ - * / ^`.
    Op(char),
    LParen,
    RParen,
}

/// Outcome of one worker-side evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub value: f64,
    /// Simulated execution time actually slept.
    pub elapsed: Duration,
}

// ---------------------------------------------------------------------------
// Validation (dispatcher precondition)
// ---------------------------------------------------------------------------

/// Reject expressions the engine should never see: characters outside the
/// grammar, unbalanced parentheses, malformed numeric literals.
///
/// The tokenizer itself drops unknown characters silently, so this check
/// is the only place a stray symbol is ever reported.
pub fn validate(expression: &str) -> Result<()> {
    if !CHARSET.is_match(expression) {
        return Err(Error::InvalidExpression(
            "unsupported characters".to_string(),
        ));
    }

    let mut depth: i64 = 0;
    for c in expression.chars() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            _ => {}
        }
        if depth < 0 {
            return Err(Error::InvalidExpression(
                "mismatched parentheses".to_string(),
            ));
        }
    }
    if depth != 0 {
        return Err(Error::InvalidExpression(
            "mismatched parentheses".to_string(),
        ));
    }

    for token in tokenize(expression) {
        if let Token::Number(lit) = token {
            if !NUMBER.is_match(&lit) {
                return Err(Error::InvalidExpression(format!(
                    "malformed number '{lit}'"
                )));
            }
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

/// Scan left to right. Digit/`.` runs accumulate into one number token;
/// operators and parentheses are single-character tokens; anything else is
/// dropped (callers pre-validate with [`validate`]).
pub fn tokenize(expression: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut current = String::new();

    for c in expression.chars() {
        if c.is_ascii_digit() || c == '.' {
            current.push(c);
            continue;
        }
        if !current.is_empty() {
            tokens.push(Token::Number(std::mem::take(&mut current)));
        }
        match c {
            '+' | '-' | '*' | '/' | '^' => tokens.push(Token::Op(c)),
            '(' => tokens.push(Token::LParen),
            ')' => tokens.push(Token::RParen),
            _ => {} // silently dropped
        }
    }
    if !current.is_empty() {
        tokens.push(Token::Number(current));
    }

    tokens
}

// ---------------------------------------------------------------------------
// Shunting-yard
// ---------------------------------------------------------------------------

fn precedence(op: char) -> u8 {
    match op {
        '+' | '-' => 1,
        '*' | '/' => 2,
        '^' => 3,
        _ => 0,
    }
}

/// Convert infix tokens to postfix order.
pub fn to_postfix(infix: Vec<Token>) -> Result<Vec<Token>> {
    let mut output = Vec::with_capacity(infix.len());
    let mut operators: Vec<Token> = Vec::new();

    for token in infix {
        match token {
            Token::Number(_) => output.push(token),
            Token::LParen => operators.push(token),
            Token::RParen => loop {
                match operators.pop() {
                    Some(Token::LParen) => break,
                    Some(op) => output.push(op),
                    None => {
                        return Err(Error::InvalidExpression(
                            "mismatched parentheses".to_string(),
                        ));
                    }
                }
            },
            Token::Op(op) => {
                // All operators left-associative: pop while stack top has
                // precedence >= the incoming operator's.
                while matches!(
                    operators.last(),
                    Some(Token::Op(top)) if precedence(*top) >= precedence(op)
                ) {
                    if let Some(top) = operators.pop() {
                        output.push(top);
                    }
                }
                operators.push(Token::Op(op));
            }
        }
    }

    while let Some(op) = operators.pop() {
        if matches!(op, Token::LParen) {
            return Err(Error::InvalidExpression(
                "mismatched parentheses".to_string(),
            ));
        }
        output.push(op);
    }

    Ok(output)
}

// ---------------------------------------------------------------------------
// Postfix evaluation
// ---------------------------------------------------------------------------

/// Evaluate a postfix token stream with a numeric stack.
pub fn eval_postfix(postfix: &[Token]) -> Result<f64> {
    let mut stack: Vec<f64> = Vec::new();

    for token in postfix {
        match token {
            Token::Number(lit) => {
                let n: f64 = lit.parse().map_err(|_| {
                    Error::InvalidExpression(format!("malformed number '{lit}'"))
                })?;
                stack.push(n);
            }
            Token::Op(op) => {
                let b = stack.pop();
                let a = stack.pop();
                let (Some(a), Some(b)) = (a, b) else {
                    return Err(Error::InvalidExpression(format!(
                        "missing operand for '{op}'"
                    )));
                };
                let value = match op {
                    '+' => a + b,
                    '-' => a - b,
                    '*' => a * b,
                    '^' => a.powf(b),
                    '/' => {
                        if b == 0.0 {
                            return Err(Error::DivisionByZero);
                        }
                        a / b
                    }
                    other => {
                        return Err(Error::InvalidExpression(format!(
                            "unknown operator '{other}'"
                        )));
                    }
                };
                stack.push(value);
            }
            Token::LParen | Token::RParen => {
                return Err(Error::InvalidExpression(
                    "mismatched parentheses".to_string(),
                ));
            }
        }
    }

    if stack.len() != 1 {
        return Err(Error::InvalidExpression(format!(
            "unbalanced expression: {} values left on stack",
            stack.len()
        )));
    }
    Ok(stack[0])
}

/// Tokenize, convert, evaluate. No cost sleep; used by the worker and by
/// tests that only care about the numeric answer.
pub fn compute(expression: &str) -> Result<f64> {
    eval_postfix(&to_postfix(tokenize(expression))?)
}

// ---------------------------------------------------------------------------
// Cost model
// ---------------------------------------------------------------------------

/// Sum the cost-table value for every operator character in the *original*
/// expression string. This is the simulated execution time, a throughput
/// shaping knob, not real compute cost.
pub fn cost_duration(expression: &str, costs: &CostTable) -> Duration {
    // Costs are caller-supplied; saturate rather than overflow.
    let total_ms = expression
        .chars()
        .filter_map(|c| costs.cost_of(c))
        .fold(0u64, u64::saturating_add);
    Duration::from_millis(total_ms)
}

/// Full worker-side evaluation: compute the value, then sleep the simulated
/// cost before returning.
pub async fn evaluate(expression: &str, costs: &CostTable) -> Result<Evaluation> {
    let value = compute(expression)?;
    let elapsed = cost_duration(expression, costs);
    tokio::time::sleep(elapsed).await;
    Ok(Evaluation { value, elapsed })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ops(postfix: &[Token]) -> String {
        postfix
            .iter()
            .map(|t| match t {
                Token::Number(n) => n.clone(),
                Token::Op(c) => c.to_string(),
                Token::LParen => "(".to_string(),
                Token::RParen => ")".to_string(),
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn tokenize_splits_numbers_and_operators() {
        let tokens = tokenize("12+3.5*(4-1)");
        assert_eq!(
            tokens,
            vec![
                Token::Number("12".into()),
                Token::Op('+'),
                Token::Number("3.5".into()),
                Token::Op('*'),
                Token::LParen,
                Token::Number("4".into()),
                Token::Op('-'),
                Token::Number("1".into()),
                Token::RParen,
            ]
        );
    }

    #[test]
    fn tokenize_drops_unknown_characters() {
        assert_eq!(tokenize("1 +a2"), tokenize("1+2"));
    }

    #[test]
    fn postfix_respects_precedence() {
        let postfix = to_postfix(tokenize("3+4*2")).unwrap();
        assert_eq!(ops(&postfix), "3 4 2 * +");
    }

    #[test]
    fn same_precedence_evaluates_left_to_right() {
        assert_eq!(compute("2-3-4").unwrap(), -5.0);
        assert_eq!(compute("100/10/2").unwrap(), 5.0);
    }

    #[test]
    fn caret_is_left_associative() {
        // Deviates from the usual right-associative convention: the
        // precedence table gives `^` no special associativity, so
        // 2^3^2 = (2^3)^2 = 64, not 2^(3^2) = 512.
        assert_eq!(compute("2^3^2").unwrap(), 64.0);
    }

    #[test]
    fn parentheses_override_precedence() {
        assert_eq!(compute("(1+2)*3").unwrap(), 9.0);
        assert_eq!(compute("3+4*2").unwrap(), 11.0);
    }

    #[test]
    fn division_by_zero_is_reported() {
        assert!(matches!(compute("10/0"), Err(Error::DivisionByZero)));
    }

    #[test]
    fn unmatched_close_paren_fails() {
        assert!(matches!(
            compute("1+2)"),
            Err(Error::InvalidExpression(_))
        ));
    }

    #[test]
    fn unmatched_open_paren_fails() {
        assert!(matches!(
            compute("(1+2"),
            Err(Error::InvalidExpression(_))
        ));
    }

    #[test]
    fn leftover_operands_fail() {
        assert!(matches!(compute("1 2"), Err(Error::InvalidExpression(_))));
        assert!(matches!(compute("1+"), Err(Error::InvalidExpression(_))));
    }

    #[test]
    fn validate_rejects_unknown_symbols() {
        assert!(matches!(
            validate("1a+2"),
            Err(Error::InvalidExpression(_))
        ));
        assert!(matches!(validate(""), Err(Error::InvalidExpression(_))));
    }

    #[test]
    fn validate_rejects_unbalanced_parens() {
        assert!(validate("(1+2").is_err());
        assert!(validate("1+2)").is_err());
        assert!(validate(")(").is_err());
        assert!(validate("(1+2)*3").is_ok());
    }

    #[test]
    fn validate_rejects_malformed_numbers() {
        assert!(matches!(
            validate("1.2.3+4"),
            Err(Error::InvalidExpression(_))
        ));
        assert!(matches!(
            validate(".5+1"),
            Err(Error::InvalidExpression(_))
        ));
        assert!(validate("1.25+4").is_ok());
    }

    #[test]
    fn cost_sums_per_operator_character() {
        let costs = CostTable {
            add: 100,
            mul: 50,
            ..CostTable::default()
        };
        assert_eq!(
            cost_duration("1+2*3", &costs),
            Duration::from_millis(150)
        );
        // Cost counts raw characters of the original string, parens free.
        assert_eq!(
            cost_duration("(1+2)*(3+4)", &costs),
            Duration::from_millis(250)
        );
        assert_eq!(cost_duration("42", &costs), Duration::ZERO);
    }

    #[test]
    fn cost_saturates_instead_of_overflowing() {
        let costs = CostTable {
            add: u64::MAX,
            ..CostTable::default()
        };
        assert_eq!(
            cost_duration("1+1+1", &costs),
            Duration::from_millis(u64::MAX)
        );
    }

    #[tokio::test]
    async fn evaluate_reports_elapsed_cost() {
        let costs = CostTable {
            add: 10,
            ..CostTable::default()
        };
        let eval = evaluate("1+2", &costs).await.unwrap();
        assert_eq!(eval.value, 3.0);
        assert_eq!(eval.elapsed, Duration::from_millis(10));
    }
}
