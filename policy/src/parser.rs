//! Recursive-descent parser from tokens to [`crate::ast::Document`].

use thiserror::Error;

use crate::ast::ActionClause;
use crate::ast::CmpOp;
use crate::ast::ConditionBlock;
use crate::ast::ConditionKind;
use crate::ast::Document;
use crate::ast::Effect;
use crate::ast::EntityRef;
use crate::ast::Expr;
use crate::ast::Policy;
use crate::ast::PrincipalClause;
use crate::ast::ResourceClause;
use crate::lexer::LexError;
use crate::lexer::Spanned;
use crate::lexer::Token;
use crate::lexer::lex;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("lex error: {0}")]
    Lex(#[from] LexError),
    #[error("line {line}: expected {expected}, found {found:?}")]
    Unexpected {
        line: usize,
        expected: &'static str,
        found: Option<Token>,
    },
}

pub fn parse(input: &str) -> Result<Document, ParseError> {
    let tokens = lex(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    parser.parse_document()
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|s| &s.token)
    }

    fn current_line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|s| s.line)
            .unwrap_or(0)
    }

    fn advance(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).map(|s| s.token.clone());
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, expected: &Token, label: &'static str) -> Result<(), ParseError> {
        match self.advance() {
            Some(ref t) if t == expected => Ok(()),
            other => Err(ParseError::Unexpected {
                line: self.current_line(),
                expected: label,
                found: other,
            }),
        }
    }

    fn expect_ident(&mut self, expected: &str, label: &'static str) -> Result<(), ParseError> {
        match self.advance() {
            Some(Token::Ident(s)) if s.eq_ignore_ascii_case(expected) => Ok(()),
            other => Err(ParseError::Unexpected {
                line: self.current_line(),
                expected: label,
                found: other,
            }),
        }
    }

    fn peek_ident_is(&self, expected: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(s)) if s.eq_ignore_ascii_case(expected))
    }

    fn parse_document(&mut self) -> Result<Document, ParseError> {
        let mut policies = Vec::new();
        let mut index = 0usize;
        while self.peek().is_some() {
            policies.push(self.parse_policy(index)?);
            index += 1;
        }
        Ok(Document { policies })
    }

    fn parse_policy(&mut self, index: usize) -> Result<Policy, ParseError> {
        let effect = match self.advance() {
            Some(Token::Ident(s)) if s.eq_ignore_ascii_case("permit") => Effect::Permit,
            Some(Token::Ident(s)) if s.eq_ignore_ascii_case("forbid") => Effect::Forbid,
            other => {
                return Err(ParseError::Unexpected {
                    line: self.current_line(),
                    expected: "'permit' or 'forbid'",
                    found: other,
                });
            }
        };

        self.expect(&Token::LParen, "'('")?;
        let principal = self.parse_principal_clause()?;
        self.expect(&Token::Comma, "','")?;
        let action = self.parse_action_clause()?;
        self.expect(&Token::Comma, "','")?;
        let resource = self.parse_resource_clause()?;
        self.expect(&Token::RParen, "')'")?;

        let mut conditions = Vec::new();
        while self.peek_ident_is("when") || self.peek_ident_is("unless") {
            conditions.push(self.parse_condition_block()?);
        }

        self.expect(&Token::Semicolon, "';'")?;

        Ok(Policy {
            id: format!("policy#{index}"),
            effect,
            principal,
            action,
            resource,
            conditions,
        })
    }

    fn parse_principal_clause(&mut self) -> Result<PrincipalClause, ParseError> {
        self.expect_ident("principal", "'principal'")?;
        match self.peek() {
            Some(Token::EqEq) | Some(Token::Ident(_)) if self.peek_ident_is("in") || matches!(self.peek(), Some(Token::EqEq)) => {
                self.advance();
                let _ = self.parse_entity_ref_or_list()?;
                Ok(PrincipalClause::Constrained)
            }
            _ => Ok(PrincipalClause::Any),
        }
    }

    fn parse_action_clause(&mut self) -> Result<ActionClause, ParseError> {
        self.expect_ident("action", "'action'")?;
        match self.peek() {
            Some(Token::EqEq) => {
                self.advance();
                let entity = self.parse_entity_ref()?;
                Ok(ActionClause { entity: Some(entity), non_canonical: false })
            }
            Some(Token::Ident(s)) if s.eq_ignore_ascii_case("in") => {
                self.advance();
                let entities = self.parse_entity_list()?;
                Ok(ActionClause {
                    entity: entities.into_iter().next(),
                    non_canonical: true,
                })
            }
            _ => Ok(ActionClause { entity: None, non_canonical: false }),
        }
    }

    fn parse_resource_clause(&mut self) -> Result<ResourceClause, ParseError> {
        self.expect_ident("resource", "'resource'")?;
        if self.peek_ident_is("in") {
            self.advance();
            let entities = self.parse_entity_list()?;
            Ok(ResourceClause { entities: Some(entities) })
        } else {
            Ok(ResourceClause { entities: None })
        }
    }

    /// Consumes either a bracketed list or a single entity ref, used for
    /// principal clauses we don't otherwise care about the contents of.
    fn parse_entity_ref_or_list(&mut self) -> Result<Vec<EntityRef>, ParseError> {
        if self.peek() == Some(&Token::LBracket) {
            self.parse_entity_list()
        } else {
            Ok(vec![self.parse_entity_ref()?])
        }
    }

    fn parse_entity_list(&mut self) -> Result<Vec<EntityRef>, ParseError> {
        self.expect(&Token::LBracket, "'['")?;
        let mut entities = Vec::new();
        if self.peek() != Some(&Token::RBracket) {
            entities.push(self.parse_entity_ref()?);
            while self.peek() == Some(&Token::Comma) {
                self.advance();
                entities.push(self.parse_entity_ref()?);
            }
        }
        self.expect(&Token::RBracket, "']'")?;
        Ok(entities)
    }

    fn parse_entity_ref(&mut self) -> Result<EntityRef, ParseError> {
        let mut segments = Vec::new();
        match self.advance() {
            Some(Token::Ident(s)) => segments.push(s),
            other => {
                return Err(ParseError::Unexpected {
                    line: self.current_line(),
                    expected: "entity type identifier",
                    found: other,
                });
            }
        }

        loop {
            if self.peek() != Some(&Token::ColonColon) {
                return Err(ParseError::Unexpected {
                    line: self.current_line(),
                    expected: "'::'",
                    found: self.peek().cloned(),
                });
            }
            self.advance();
            match self.advance() {
                Some(Token::Ident(s)) => segments.push(s),
                Some(Token::Str(id)) => {
                    return Ok(EntityRef { ty: segments.join("::"), id });
                }
                other => {
                    return Err(ParseError::Unexpected {
                        line: self.current_line(),
                        expected: "entity id string or further type segment",
                        found: other,
                    });
                }
            }
        }
    }

    fn parse_condition_block(&mut self) -> Result<ConditionBlock, ParseError> {
        let kind = match self.advance() {
            Some(Token::Ident(s)) if s.eq_ignore_ascii_case("when") => ConditionKind::When,
            Some(Token::Ident(s)) if s.eq_ignore_ascii_case("unless") => ConditionKind::Unless,
            other => {
                return Err(ParseError::Unexpected {
                    line: self.current_line(),
                    expected: "'when' or 'unless'",
                    found: other,
                });
            }
        };
        self.expect(&Token::LBrace, "'{'")?;
        let expr = self.parse_and_expr()?;
        self.expect(&Token::RBrace, "'}'")?;
        Ok(ConditionBlock { kind, expr })
    }

    fn parse_and_expr(&mut self) -> Result<Expr, ParseError> {
        let mut terms = vec![self.parse_cmp_expr()?];
        while self.peek() == Some(&Token::AndAnd) {
            self.advance();
            terms.push(self.parse_cmp_expr()?);
        }
        if terms.len() == 1 {
            Ok(terms.remove(0))
        } else {
            Ok(Expr::And(terms))
        }
    }

    fn parse_cmp_expr(&mut self) -> Result<Expr, ParseError> {
        if self.peek_ident_is("resource") {
            let save = self.pos;
            self.advance();
            if self.peek_ident_is("in") {
                self.advance();
                let entities = self.parse_entity_list()?;
                return Ok(Expr::ResourceIn(entities));
            }
            self.pos = save;
        }

        if self.peek_ident_is("context") {
            let save = self.pos;
            self.advance();
            if self.peek() == Some(&Token::Dot) {
                self.advance();
                if let Some(Token::Ident(key)) = self.advance() {
                    let op = match self.advance() {
                        Some(Token::EqEq) => Some(CmpOp::Equals),
                        Some(Token::Ident(s)) if s.eq_ignore_ascii_case("equals") => Some(CmpOp::Equals),
                        Some(Token::Ident(s)) if s.eq_ignore_ascii_case("like") => Some(CmpOp::Like),
                        _ => None,
                    };
                    if let Some(op) = op {
                        if let Some(Token::Str(value)) = self.advance() {
                            return Ok(Expr::ContextCmp { key, op, value });
                        }
                    }
                }
            }
            self.pos = save;
        }

        // Unsupported shape: consume tokens up to the next `&&` or `}` so
        // parsing can continue, and surface the raw text for lint messages.
        let mut raw = String::new();
        while !matches!(self.peek(), Some(Token::AndAnd) | Some(Token::RBrace) | None) {
            if let Some(tok) = self.advance() {
                raw.push_str(&format!("{tok:?} "));
            }
        }
        Ok(Expr::Unsupported(raw.trim().to_string()))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;
    use crate::ast::Effect;

    #[test]
    fn parses_simple_file_open_permit() {
        let doc = parse(r#"permit(principal, action == Action::"FileOpen", resource in [File::"/tmp/a"]);"#).unwrap();
        assert_eq!(doc.policies.len(), 1);
        let p = &doc.policies[0];
        assert_eq!(p.effect, Effect::Permit);
        assert_eq!(p.action.entity.as_ref().unwrap().id, "FileOpen");
        assert_eq!(p.resource.entities.as_ref().unwrap()[0].id, "/tmp/a");
    }

    #[test]
    fn parses_forbid_with_wildcard_host_condition() {
        let doc = parse(
            r#"forbid(principal, action == Action::"NetworkConnect", resource) when { resource in [Host::"*"] };"#,
        )
        .unwrap();
        assert_eq!(doc.policies.len(), 1);
        let cond = &doc.policies[0].conditions[0];
        assert_eq!(cond.kind, ConditionKind::When);
        match &cond.expr {
            Expr::ResourceIn(list) => assert_eq!(list[0].id, "*"),
            other => panic!("unexpected expr: {other:?}"),
        }
    }

    #[test]
    fn parses_multiple_policies() {
        let doc = parse(
            r#"
            permit(principal, action == Action::"FileOpen", resource in [File::"/a"]);
            permit(principal, action == Action::"ProcessExec", resource in [File::"/bin/ls"]);
            "#,
        )
        .unwrap();
        assert_eq!(doc.policies.len(), 2);
        assert_eq!(doc.policies[0].id, "policy#0");
        assert_eq!(doc.policies[1].id, "policy#1");
    }

    #[test]
    fn parses_context_hostname_like_condition() {
        let doc = parse(
            r#"permit(principal, action == Action::"HttpRewrite", resource in [Host::"example.com"]) when { context.header == "X-Foo" && context.value == "bar" };"#,
        )
        .unwrap();
        let cond = &doc.policies[0].conditions[0];
        match &cond.expr {
            Expr::And(terms) => assert_eq!(terms.len(), 2),
            other => panic!("unexpected expr: {other:?}"),
        }
    }
}
