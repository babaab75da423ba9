//! The built-in `calc` engine.
//!
//! A deliberately small expression language, enough to exercise the
//! protocol end to end and drive the demos:
//!
//! - integer and float arithmetic: `+ - * /`, unary minus, parentheses
//! - single- or double-quoted string literals; `+` concatenates when either
//!   operand is a string
//! - identifiers resolve against the VM's bindings; `name = expr` assigns
//! - `;` separates statements; the value of the last statement is the result
//! - builtins: `primes(lo, hi)` and `is_prime(n)`
//!
//! Syntax errors, unbound identifiers and type mismatches all surface as
//! [`EvalError::Failed`] with a human-readable detail. The abort signal is
//! polled between statements and inside the `primes` scan.
use super::{AbortSignal, EvalError, Evaluator};
use crate::binding::{BindingValue, Bindings};

pub struct Calc;

impl Evaluator for Calc {
    fn evaluate(
        &self,
        expression: &str,
        bindings: &mut Bindings,
        abort: &AbortSignal,
    ) -> Result<BindingValue, EvalError> {
        let tokens = tokenize(expression)?;
        Parser {
            tokens,
            pos: 0,
            abort,
        }
        .program(bindings)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
    Comma,
    Assign,
    Semi,
}

fn tokenize(input: &str) -> Result<Vec<Token>, EvalError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '+' => push_symbol(&mut chars, &mut tokens, Token::Plus),
            '-' => push_symbol(&mut chars, &mut tokens, Token::Minus),
            '*' => push_symbol(&mut chars, &mut tokens, Token::Star),
            '/' => push_symbol(&mut chars, &mut tokens, Token::Slash),
            '(' => push_symbol(&mut chars, &mut tokens, Token::LParen),
            ')' => push_symbol(&mut chars, &mut tokens, Token::RParen),
            ',' => push_symbol(&mut chars, &mut tokens, Token::Comma),
            '=' => push_symbol(&mut chars, &mut tokens, Token::Assign),
            ';' => push_symbol(&mut chars, &mut tokens, Token::Semi),
            '\'' | '"' => {
                let quote = c;
                chars.next();
                let mut literal = String::new();
                loop {
                    match chars.next() {
                        Some(c) if c == quote => break,
                        Some(c) => literal.push(c),
                        None => return Err(EvalError::failed("unterminated string literal")),
                    }
                }
                tokens.push(Token::Str(literal));
            }
            c if c.is_ascii_digit() => {
                let mut number = String::new();
                let mut is_float = false;
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() {
                        number.push(c);
                        chars.next();
                    } else if c == '.' && !is_float {
                        is_float = true;
                        number.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                // A digit run flowing straight into an identifier ("2sdf")
                // is a malformed literal, not two tokens.
                if chars.peek().is_some_and(|c| c.is_alphanumeric() || *c == '_') {
                    return Err(EvalError::failed(format!(
                        "malformed number literal near '{number}'"
                    )));
                }
                let token = if is_float {
                    Token::Float(
                        number
                            .parse()
                            .map_err(|_| EvalError::failed(format!("bad float '{number}'")))?,
                    )
                } else {
                    Token::Int(
                        number
                            .parse()
                            .map_err(|_| EvalError::failed(format!("bad integer '{number}'")))?,
                    )
                };
                tokens.push(token);
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            other => {
                return Err(EvalError::failed(format!("unexpected character '{other}'")));
            }
        }
    }

    Ok(tokens)
}

fn push_symbol(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    tokens: &mut Vec<Token>,
    token: Token,
) {
    chars.next();
    tokens.push(token);
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    abort: &'a AbortSignal,
}

impl Parser<'_> {
    fn program(&mut self, bindings: &mut Bindings) -> Result<BindingValue, EvalError> {
        let mut last = BindingValue::Empty;
        let mut saw_statement = false;

        while self.peek().is_some() {
            if self.eat(&Token::Semi) {
                continue;
            }
            if self.abort.is_cancelled() {
                return Err(EvalError::Aborted);
            }
            last = self.statement(bindings)?;
            saw_statement = true;
            // A statement ends at ';' or at the end of input.
            if self.peek().is_some() && !self.eat(&Token::Semi) {
                return Err(EvalError::failed(format!(
                    "unexpected token after statement: {:?}",
                    self.peek()
                )));
            }
        }

        if !saw_statement {
            return Err(EvalError::failed("empty expression"));
        }
        Ok(last)
    }

    fn statement(&mut self, bindings: &mut Bindings) -> Result<BindingValue, EvalError> {
        // Assignment: IDENT '=' expr. Anything else is a bare expression.
        if let Some(Token::Ident(name)) = self.peek() {
            if self.peek_at(1) == Some(&Token::Assign) {
                let name = name.clone();
                self.pos += 2;
                let value = self.expr(bindings)?;
                bindings.set(name, value.clone());
                return Ok(value);
            }
        }
        self.expr(bindings)
    }

    fn expr(&mut self, bindings: &mut Bindings) -> Result<BindingValue, EvalError> {
        let mut value = self.term(bindings)?;
        loop {
            if self.eat(&Token::Plus) {
                value = add(value, self.term(bindings)?)?;
            } else if self.eat(&Token::Minus) {
                value = numeric(value, self.term(bindings)?, "-", i64::checked_sub, |a, b| {
                    a - b
                })?;
            } else {
                return Ok(value);
            }
        }
    }

    fn term(&mut self, bindings: &mut Bindings) -> Result<BindingValue, EvalError> {
        let mut value = self.factor(bindings)?;
        loop {
            if self.eat(&Token::Star) {
                value = numeric(value, self.factor(bindings)?, "*", i64::checked_mul, |a, b| {
                    a * b
                })?;
            } else if self.eat(&Token::Slash) {
                value = divide(value, self.factor(bindings)?)?;
            } else {
                return Ok(value);
            }
        }
    }

    fn factor(&mut self, bindings: &mut Bindings) -> Result<BindingValue, EvalError> {
        match self.next() {
            Some(Token::Int(n)) => Ok(BindingValue::Int(n)),
            Some(Token::Float(x)) => Ok(BindingValue::Float(x)),
            Some(Token::Str(s)) => Ok(BindingValue::Str(s)),
            Some(Token::Minus) => match self.factor(bindings)? {
                BindingValue::Int(n) => n
                    .checked_neg()
                    .map(BindingValue::Int)
                    .ok_or_else(|| EvalError::failed("integer overflow in '-'")),
                BindingValue::Float(x) => Ok(BindingValue::Float(-x)),
                other => Err(EvalError::failed(format!(
                    "cannot negate a {}",
                    other.type_tag()
                ))),
            },
            Some(Token::LParen) => {
                let value = self.expr(bindings)?;
                if !self.eat(&Token::RParen) {
                    return Err(EvalError::failed("expected ')'"));
                }
                Ok(value)
            }
            Some(Token::Ident(name)) => {
                if self.eat(&Token::LParen) {
                    let args = self.arguments(bindings)?;
                    return self.builtin(&name, args);
                }
                match bindings.get(&name) {
                    BindingValue::Empty => {
                        Err(EvalError::failed(format!("unbound identifier '{name}'")))
                    }
                    value => Ok(value),
                }
            }
            other => Err(EvalError::failed(format!("unexpected token: {other:?}"))),
        }
    }

    fn arguments(&mut self, bindings: &mut Bindings) -> Result<Vec<BindingValue>, EvalError> {
        let mut args = Vec::new();
        if self.eat(&Token::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.expr(bindings)?);
            if self.eat(&Token::RParen) {
                return Ok(args);
            }
            if !self.eat(&Token::Comma) {
                return Err(EvalError::failed("expected ',' or ')' in argument list"));
            }
        }
    }

    fn builtin(&self, name: &str, args: Vec<BindingValue>) -> Result<BindingValue, EvalError> {
        match name {
            "primes" => {
                let (lo, hi) = match args.as_slice() {
                    [BindingValue::Int(lo), BindingValue::Int(hi)] => (*lo, *hi),
                    _ => return Err(EvalError::failed("primes expects two integer arguments")),
                };
                let mut found = Vec::new();
                for candidate in lo.max(2)..=hi {
                    if self.abort.is_cancelled() {
                        return Err(EvalError::Aborted);
                    }
                    if is_prime(candidate) {
                        found.push(candidate.to_string());
                    }
                }
                Ok(BindingValue::Str(found.join(",")))
            }
            "is_prime" => match args.as_slice() {
                [BindingValue::Int(n)] => Ok(BindingValue::Bool(is_prime(*n))),
                _ => Err(EvalError::failed("is_prime expects one integer argument")),
            },
            other => Err(EvalError::failed(format!("unknown function '{other}'"))),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }
}

fn add(a: BindingValue, b: BindingValue) -> Result<BindingValue, EvalError> {
    use BindingValue::*;
    match (a, b) {
        // String on either side concatenates the display forms.
        (Str(a), b) => Ok(Str(format!("{a}{b}"))),
        (a, Str(b)) => Ok(Str(format!("{a}{b}"))),
        (Int(a), Int(b)) => a
            .checked_add(b)
            .map(Int)
            .ok_or_else(|| EvalError::failed("integer overflow")),
        (Int(a), Float(b)) => Ok(Float(a as f64 + b)),
        (Float(a), Int(b)) => Ok(Float(a + b as f64)),
        (Float(a), Float(b)) => Ok(Float(a + b)),
        (a, b) => Err(EvalError::failed(format!(
            "cannot add {} and {}",
            a.type_tag(),
            b.type_tag()
        ))),
    }
}

fn numeric(
    a: BindingValue,
    b: BindingValue,
    op: &str,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> Result<BindingValue, EvalError> {
    use BindingValue::*;
    match (a, b) {
        (Int(a), Int(b)) => int_op(a, b)
            .map(Int)
            .ok_or_else(|| EvalError::failed(format!("integer overflow in '{op}'"))),
        (Int(a), Float(b)) => Ok(Float(float_op(a as f64, b))),
        (Float(a), Int(b)) => Ok(Float(float_op(a, b as f64))),
        (Float(a), Float(b)) => Ok(Float(float_op(a, b))),
        (a, b) => Err(EvalError::failed(format!(
            "cannot apply '{op}' to {} and {}",
            a.type_tag(),
            b.type_tag()
        ))),
    }
}

fn divide(a: BindingValue, b: BindingValue) -> Result<BindingValue, EvalError> {
    use BindingValue::*;
    match (&a, &b) {
        (_, Int(0)) => Err(EvalError::failed("division by zero")),
        (_, Float(x)) if *x == 0.0 => Err(EvalError::failed("division by zero")),
        // checked_div also rejects i64::MIN / -1.
        _ => numeric(a, b, "/", i64::checked_div, |a, b| a / b),
    }
}

fn is_prime(n: i64) -> bool {
    if n < 2 {
        return false;
    }
    let mut d = 2;
    // d <= n / d, not d * d <= n: the square overflows near i64::MAX.
    while d <= n / d {
        if n % d == 0 {
            return false;
        }
        d += 1;
    }
    true
}
