//! Recursive-descent parser for the policy DSL.
//!
//! Grammar (one token of lookahead):
//!
//! ```text
//! root        = statement* EOF
//! statement   = (module | require | rule) ";"*
//! module      = "module" "{" (identifier expr ";"*)* "}"
//! require     = "require" "{" ("type" identifier ";"*)* "}"
//! rule        = ("allow" | "deny") identifier (identifier | "*")
//!               "{" (identifier ("," identifier)* ","?)? "}"
//! expr        = term (("+" | "-") term)*
//! term        = unary (("*" | "/" | "%") unary)*
//! unary       = "-" unary | literal
//! literal     = string | integer | "true" | "false"
//! ```

use crate::ast::{
    AllowDeny, BinaryOperator, Expression, Ident, Literal, LiteralKind, ModuleBlock,
    ModuleProperty, RequireBlock, RequireType, Root, RuleKind, Statement, Target,
};
use crate::error::ParseError;
use crate::lexer::{lex, Token, TokenKind};
use crate::span::{Location, Range};

/// Module properties the compiler understands.
const MODULE_PROPERTIES: [&str; 3] = ["name", "author", "version"];

/// Parse policy source into a syntax tree.
pub fn parse(source: &str) -> Result<Root, ParseError> {
    Parser::new(lex(source)?).parse_root()
}

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    seen_module: bool,
}

impl Parser {
    /// `tokens` must end with [`TokenKind::EndOfFile`], as produced by [`lex`].
    #[must_use]
    pub const fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            seen_module: false,
        }
    }

    fn peek(&self) -> &Token {
        let last = self.tokens.len().saturating_sub(1);
        &self.tokens[self.pos.min(last)]
    }

    fn consume(&mut self) -> Token {
        let token = self.peek().clone();
        if token.kind != TokenKind::EndOfFile {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, kinds: &[TokenKind]) -> Result<Token, ParseError> {
        let token = self.peek();
        if kinds.contains(&token.kind) {
            return Ok(self.consume());
        }

        let expected = kinds
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" or ");
        Err(ParseError::new(
            format!("Expected {expected}, found {}", describe(token)),
            token.range,
        ))
    }

    fn at(&self, kind: TokenKind) -> bool {
        self.peek().kind == kind
    }

    fn skip_semicolons(&mut self) {
        while self.at(TokenKind::Semicolon) {
            self.consume();
        }
    }

    pub fn parse_root(&mut self) -> Result<Root, ParseError> {
        let mut statements = Vec::new();

        while !self.at(TokenKind::EndOfFile) {
            statements.push(self.parse_statement()?);
        }

        let range = match (statements.first(), statements.last()) {
            (Some(first), Some(last)) => first.range().to(last.range()),
            _ => Range::point(Location::origin()),
        };

        Ok(Root { statements, range })
    }

    fn parse_statement(&mut self) -> Result<Statement, ParseError> {
        let token = self.peek();

        let statement = match token.kind {
            TokenKind::Allow | TokenKind::Deny => Statement::AllowDeny(self.parse_allow_deny()?),
            TokenKind::Module => Statement::Module(self.parse_module_block()?),
            TokenKind::Require => Statement::Require(self.parse_require_block()?),
            _ => {
                return Err(ParseError::new(
                    format!("Unexpected {}", describe(token)),
                    token.range,
                ));
            }
        };

        self.skip_semicolons();
        Ok(statement)
    }

    fn parse_module_block(&mut self) -> Result<ModuleBlock, ParseError> {
        let first = self.expect(&[TokenKind::Module])?;

        if self.seen_module {
            return Err(ParseError::new(
                "Only one module block is allowed per policy file",
                first.range,
            ));
        }
        self.seen_module = true;

        self.expect(&[TokenKind::BraceOpen])?;
        let mut properties = Vec::new();

        while !self.at(TokenKind::BraceClose) {
            let name = self.expect(&[TokenKind::Identifier])?;

            if !MODULE_PROPERTIES.contains(&name.value.as_str()) {
                return Err(ParseError::new(
                    format!(
                        "Unknown module property '{}' (expected one of: {})",
                        name.value,
                        MODULE_PROPERTIES.join(", ")
                    ),
                    name.range,
                ));
            }

            let value = self.parse_folded_expression()?;
            properties.push(ModuleProperty {
                range: name.range.to(value.range),
                name: name.value,
                value,
            });
            self.skip_semicolons();
        }

        let last = self.expect(&[TokenKind::BraceClose])?;

        Ok(ModuleBlock {
            properties,
            range: first.range.to(last.range),
        })
    }

    fn parse_require_block(&mut self) -> Result<RequireBlock, ParseError> {
        let first = self.expect(&[TokenKind::Require])?;
        self.expect(&[TokenKind::BraceOpen])?;
        let mut types = Vec::new();

        while !self.at(TokenKind::BraceClose) {
            let keyword = self.expect(&[TokenKind::Type])?;
            let identifier = self.expect(&[TokenKind::Identifier])?;
            types.push(RequireType {
                range: keyword.range.to(identifier.range),
                identifier: identifier.value,
            });
            self.skip_semicolons();
        }

        let last = self.expect(&[TokenKind::BraceClose])?;

        Ok(RequireBlock {
            types,
            range: first.range.to(last.range),
        })
    }

    fn parse_allow_deny(&mut self) -> Result<AllowDeny, ParseError> {
        let first = self.expect(&[TokenKind::Allow, TokenKind::Deny])?;
        let kind = if first.kind == TokenKind::Allow {
            RuleKind::Allow
        } else {
            RuleKind::Deny
        };

        let subject = self.expect(&[TokenKind::Identifier])?;
        let target_token = self.expect(&[TokenKind::Identifier, TokenKind::Star])?;
        let target = match target_token.kind {
            TokenKind::Star => Target::Wildcard,
            _ => Target::Type(target_token.value),
        };

        self.expect(&[TokenKind::BraceOpen])?;
        let mut permissions = Vec::new();

        while self.at(TokenKind::Identifier) {
            let permission = self.consume();
            permissions.push(Ident {
                name: permission.value,
                range: permission.range,
            });

            if self.at(TokenKind::Comma) {
                self.consume();
            } else {
                break;
            }
        }

        let last = self.expect(&[TokenKind::BraceClose])?;

        Ok(AllowDeny {
            kind,
            subject: Ident {
                name: subject.value,
                range: subject.range,
            },
            target,
            target_range: target_token.range,
            permissions,
            range: first.range.to(last.range),
        })
    }

    fn parse_folded_expression(&mut self) -> Result<Literal, ParseError> {
        let mut left = self.parse_term()?;

        while matches!(self.peek().kind, TokenKind::Plus | TokenKind::Minus) {
            let operator = if self.consume().kind == TokenKind::Plus {
                BinaryOperator::Add
            } else {
                BinaryOperator::Subtract
            };
            let right = self.parse_term()?;
            left = fold(binary(operator, left, right))?;
        }

        Ok(left)
    }

    fn parse_term(&mut self) -> Result<Literal, ParseError> {
        let mut left = self.parse_unary()?;

        loop {
            let operator = match self.peek().kind {
                TokenKind::Star => BinaryOperator::Multiply,
                TokenKind::Slash => BinaryOperator::Divide,
                TokenKind::Percent => BinaryOperator::Modulo,
                _ => return Ok(left),
            };
            self.consume();
            let right = self.parse_unary()?;
            left = fold(binary(operator, left, right))?;
        }
    }

    fn parse_unary(&mut self) -> Result<Literal, ParseError> {
        if self.at(TokenKind::Minus) {
            let minus = self.consume();
            let operand = self.parse_unary()?;
            let zero = Literal {
                kind: LiteralKind::Integer,
                value: "0".into(),
                range: Range::point(minus.range.start),
            };
            let mut folded = fold(binary(BinaryOperator::Subtract, zero, operand))?;
            folded.range = minus.range.to(folded.range);
            return Ok(folded);
        }

        let token = self.expect(&[
            TokenKind::String,
            TokenKind::Integer,
            TokenKind::True,
            TokenKind::False,
        ])?;
        let kind = match token.kind {
            TokenKind::String => LiteralKind::String,
            TokenKind::Integer => LiteralKind::Integer,
            _ => LiteralKind::Boolean,
        };

        Ok(Literal {
            kind,
            value: token.value,
            range: token.range,
        })
    }
}

fn binary(operator: BinaryOperator, left: Literal, right: Literal) -> Expression {
    let range = left.range.to(right.range);
    Expression::Binary {
        operator,
        left: Box::new(Expression::Literal(left)),
        right: Box::new(Expression::Literal(right)),
        range,
    }
}

/// Constant-fold an expression to a single integer literal.
///
/// Both operands of every operation must be integers. Division rounds
/// toward negative infinity and `%` yields the matching remainder.
pub fn fold(expression: Expression) -> Result<Literal, ParseError> {
    let (operator, left, right, range) = match expression {
        Expression::Literal(literal) => return Ok(literal),
        Expression::Binary {
            operator,
            left,
            right,
            range,
        } => (operator, fold(*left)?, fold(*right)?, range),
    };

    let lhs = integer_operand(&left, operator)?;
    let rhs = integer_operand(&right, operator)?;

    let overflow = || ParseError::new(format!("Integer overflow in '{operator}' expression"), range);
    let value = match operator {
        BinaryOperator::Add => lhs.checked_add(rhs).ok_or_else(overflow)?,
        BinaryOperator::Subtract => lhs.checked_sub(rhs).ok_or_else(overflow)?,
        BinaryOperator::Multiply => lhs.checked_mul(rhs).ok_or_else(overflow)?,
        BinaryOperator::Divide | BinaryOperator::Modulo if rhs == 0 => {
            return Err(ParseError::new("Division by zero", right.range));
        }
        BinaryOperator::Divide => floor_div(lhs, rhs).ok_or_else(overflow)?,
        BinaryOperator::Modulo => {
            let quotient = floor_div(lhs, rhs).ok_or_else(overflow)?;
            lhs - quotient * rhs
        }
    };

    Ok(Literal {
        kind: LiteralKind::Integer,
        value: value.to_string(),
        range,
    })
}

fn integer_operand(literal: &Literal, operator: BinaryOperator) -> Result<i128, ParseError> {
    if literal.kind != LiteralKind::Integer {
        return Err(ParseError::new(
            format!(
                "Operator '{operator}' expects integer operands, found {}",
                literal.kind
            ),
            literal.range,
        ));
    }

    literal
        .value
        .parse()
        .map_err(|_| ParseError::new(format!("Invalid integer value: {}", literal.value), literal.range))
}

fn floor_div(lhs: i128, rhs: i128) -> Option<i128> {
    let quotient = lhs.checked_div(rhs)?;
    if lhs % rhs != 0 && ((lhs < 0) != (rhs < 0)) {
        Some(quotient - 1)
    } else {
        Some(quotient)
    }
}

fn describe(token: &Token) -> String {
    match token.kind {
        TokenKind::Identifier => format!("identifier '{}'", token.value),
        TokenKind::String => format!("string literal \"{}\"", token.value.escape_debug()),
        TokenKind::Integer => format!("integer literal {}", token.value),
        kind => kind.to_string(),
    }
}
