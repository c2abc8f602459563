//! Restricted condition expressions for workflow gating.
//!
//! Syntax: `${{ <expr> }}` where `<expr>` is built from
//! `jobs.<name>.status` and `env.<KEY>` references, single-quoted string
//! literals, `==`/`!=`, `and`/`or`/`not`, and parentheses. A dedicated
//! tokenizer and recursive-descent parser enforce the grammar; there is no
//! general-purpose expression evaluation. References that resolve to
//! nothing make their comparison false.

use std::collections::HashMap;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConditionError {
    #[error("condition syntax error: {0}")]
    Syntax(String),
    #[error("unexpected end of condition expression")]
    UnexpectedEnd,
    #[error("unsupported reference '{0}' (expected jobs.<name>.status or env.<KEY>)")]
    BadReference(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    Eq,
    Ne,
    And,
    Or,
    Not,
    Ident(String),
    Str(String),
}

fn tokenize(input: &str) -> Result<Vec<Token>, ConditionError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '=' => {
                chars.next();
                if chars.next() != Some('=') {
                    return Err(ConditionError::Syntax("expected '=='".into()));
                }
                tokens.push(Token::Eq);
            }
            '!' => {
                chars.next();
                if chars.next() != Some('=') {
                    return Err(ConditionError::Syntax("expected '!='".into()));
                }
                tokens.push(Token::Ne);
            }
            '\'' => {
                chars.next();
                let mut literal = String::new();
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(ch) => literal.push(ch),
                        None => {
                            return Err(ConditionError::Syntax(
                                "unterminated string literal".into(),
                            ))
                        }
                    }
                }
                tokens.push(Token::Str(literal));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_alphanumeric() || ch == '_' || ch == '.' || ch == '-' {
                        ident.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(match ident.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    _ => Token::Ident(ident),
                });
            }
            other => {
                return Err(ConditionError::Syntax(format!(
                    "unexpected character '{}'",
                    other
                )))
            }
        }
    }
    Ok(tokens)
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    /// `jobs.<name>.status`
    JobStatus(String),
    /// `env.<KEY>`
    Env(String),
    Literal(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Cmp(Operand, CmpOp, Operand),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn parse(mut self) -> Result<Expr, ConditionError> {
        let expr = self.or_expr()?;
        if let Some(tok) = self.peek() {
            return Err(ConditionError::Syntax(format!(
                "trailing input at token {:?}",
                tok
            )));
        }
        Ok(expr)
    }

    fn or_expr(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.and_expr()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let right = self.and_expr()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let right = self.unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, ConditionError> {
        if self.peek() == Some(&Token::Not) {
            self.next();
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, ConditionError> {
        if self.peek() == Some(&Token::LParen) {
            self.next();
            let expr = self.or_expr()?;
            match self.next() {
                Some(Token::RParen) => return Ok(expr),
                _ => return Err(ConditionError::Syntax("expected ')'".into())),
            }
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, ConditionError> {
        let lhs = self.operand()?;
        let op = match self.next() {
            Some(Token::Eq) => CmpOp::Eq,
            Some(Token::Ne) => CmpOp::Ne,
            Some(tok) => {
                return Err(ConditionError::Syntax(format!(
                    "expected '==' or '!=', found {:?}",
                    tok
                )))
            }
            None => return Err(ConditionError::UnexpectedEnd),
        };
        let rhs = self.operand()?;
        Ok(Expr::Cmp(lhs, op, rhs))
    }

    fn operand(&mut self) -> Result<Operand, ConditionError> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Operand::Literal(s)),
            Some(Token::Ident(ident)) => {
                let parts: Vec<&str> = ident.split('.').collect();
                match parts.as_slice() {
                    ["jobs", name, "status"] if !name.is_empty() => {
                        Ok(Operand::JobStatus(name.to_string()))
                    }
                    ["env", key] if !key.is_empty() => Ok(Operand::Env(key.to_string())),
                    _ => Err(ConditionError::BadReference(ident)),
                }
            }
            Some(tok) => Err(ConditionError::Syntax(format!(
                "expected reference or string literal, found {:?}",
                tok
            ))),
            None => Err(ConditionError::UnexpectedEnd),
        }
    }
}

/// Strip the `${{ ... }}` wrapper if present.
fn inner_expression(condition: &str) -> &str {
    let trimmed = condition.trim();
    if let Some(rest) = trimmed.strip_prefix("${{") {
        if let Some(inner) = rest.strip_suffix("}}") {
            return inner.trim();
        }
    }
    trimmed
}

/// Validate condition syntax without evaluating. Used at spec load time.
pub fn validate_condition(condition: &str) -> Result<(), ConditionError> {
    let trimmed = condition.trim();
    if !(trimmed.starts_with("${{") && trimmed.ends_with("}}")) {
        return Err(ConditionError::Syntax(
            "condition must be wrapped in ${{ ... }}".into(),
        ));
    }
    let tokens = tokenize(inner_expression(condition))?;
    Parser::new(tokens).parse().map(|_| ())
}

/// Evaluates parsed conditions against job statuses and workflow env.
pub struct ConditionEvaluator {
    job_statuses: HashMap<String, String>,
    env: HashMap<String, String>,
}

impl ConditionEvaluator {
    pub fn new(job_statuses: HashMap<String, String>, env: HashMap<String, String>) -> Self {
        Self { job_statuses, env }
    }

    /// Evaluate a condition. Missing references make their comparison
    /// false rather than erroring, so a gate on an unknown job never fires.
    pub fn evaluate(&self, condition: &str) -> Result<bool, ConditionError> {
        let tokens = tokenize(inner_expression(condition))?;
        let expr = Parser::new(tokens).parse()?;
        Ok(self.eval(&expr))
    }

    fn eval(&self, expr: &Expr) -> bool {
        match expr {
            Expr::Or(l, r) => self.eval(l) || self.eval(r),
            Expr::And(l, r) => self.eval(l) && self.eval(r),
            Expr::Not(inner) => !self.eval(inner),
            Expr::Cmp(lhs, op, rhs) => {
                let (Some(left), Some(right)) = (self.resolve(lhs), self.resolve(rhs)) else {
                    return false;
                };
                match op {
                    CmpOp::Eq => left == right,
                    CmpOp::Ne => left != right,
                }
            }
        }
    }

    fn resolve(&self, operand: &Operand) -> Option<String> {
        match operand {
            Operand::Literal(s) => Some(s.clone()),
            Operand::JobStatus(name) => self.job_statuses.get(name).cloned(),
            Operand::Env(key) => self.env.get(key).cloned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evaluator() -> ConditionEvaluator {
        let mut jobs = HashMap::new();
        jobs.insert("build".to_string(), "success".to_string());
        jobs.insert("test".to_string(), "failed".to_string());
        let mut env = HashMap::new();
        env.insert("DEPLOY_ENV".to_string(), "prod".to_string());
        ConditionEvaluator::new(jobs, env)
    }

    #[test]
    fn job_status_equality() {
        let ev = evaluator();
        assert!(ev.evaluate("${{ jobs.build.status == 'success' }}").unwrap());
        assert!(!ev.evaluate("${{ jobs.build.status == 'failed' }}").unwrap());
        assert!(ev.evaluate("${{ jobs.test.status != 'success' }}").unwrap());
    }

    #[test]
    fn env_reference() {
        let ev = evaluator();
        assert!(ev.evaluate("${{ env.DEPLOY_ENV == 'prod' }}").unwrap());
        assert!(!ev.evaluate("${{ env.DEPLOY_ENV == 'staging' }}").unwrap());
    }

    #[test]
    fn boolean_operators() {
        let ev = evaluator();
        assert!(ev
            .evaluate("${{ jobs.build.status == 'success' and env.DEPLOY_ENV == 'prod' }}")
            .unwrap());
        assert!(ev
            .evaluate("${{ jobs.test.status == 'success' or env.DEPLOY_ENV == 'prod' }}")
            .unwrap());
        assert!(ev
            .evaluate("${{ not jobs.build.status == 'failed' }}")
            .unwrap());
    }

    #[test]
    fn precedence_and_parens() {
        let ev = evaluator();
        // and binds tighter than or
        assert!(ev
            .evaluate(
                "${{ jobs.build.status == 'success' or jobs.test.status == 'success' and env.DEPLOY_ENV == 'staging' }}"
            )
            .unwrap());
        // parens flip it
        assert!(!ev
            .evaluate(
                "${{ (jobs.build.status == 'success' or jobs.test.status == 'success') and env.DEPLOY_ENV == 'staging' }}"
            )
            .unwrap());
    }

    #[test]
    fn missing_references_are_false() {
        let ev = evaluator();
        assert!(!ev.evaluate("${{ jobs.ghost.status == 'success' }}").unwrap());
        assert!(!ev.evaluate("${{ jobs.ghost.status != 'success' }}").unwrap());
        assert!(!ev.evaluate("${{ env.MISSING == '' }}").unwrap());
        // But an or-branch can still rescue the expression
        assert!(ev
            .evaluate("${{ jobs.ghost.status == 'x' or jobs.build.status == 'success' }}")
            .unwrap());
    }

    #[test]
    fn literal_comparison() {
        let ev = evaluator();
        assert!(ev.evaluate("${{ 'a' == 'a' }}").unwrap());
        assert!(ev.evaluate("${{ 'a' != 'b' }}").unwrap());
    }

    #[test]
    fn rejects_arbitrary_expressions() {
        assert!(validate_condition("${{ __import__('os').system('id') }}").is_err());
        assert!(validate_condition("${{ jobs.build.status = 'success' }}").is_err());
        assert!(validate_condition("${{ system.exit }}").is_err());
        assert!(validate_condition("${{ jobs.build.result == 'ok' }}").is_err());
        assert!(validate_condition("${{ 1 + 1 }}").is_err());
    }

    #[test]
    fn validation_requires_wrapper() {
        assert!(validate_condition("jobs.build.status == 'success'").is_err());
        assert!(validate_condition("${{ jobs.build.status == 'success' }}").is_ok());
    }

    #[test]
    fn rejects_malformed_syntax() {
        assert!(validate_condition("${{ jobs.build.status == }}").is_err());
        assert!(validate_condition("${{ == 'x' }}").is_err());
        assert!(validate_condition("${{ jobs.build.status == 'unterminated }}").is_err());
        assert!(validate_condition("${{ (jobs.build.status == 'x' }}").is_err());
        assert!(validate_condition("${{ jobs.build.status == 'x' trailing }}").is_err());
    }

    #[test]
    fn evaluate_without_wrapper_parses_inner() {
        let ev = evaluator();
        assert!(ev.evaluate("jobs.build.status == 'success'").unwrap());
    }
}
