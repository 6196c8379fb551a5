//! Recursive-descent parser for Manifest source.
//!
//! Produces a [`Program`] plus syntax diagnostics. The parser never
//! fails hard: on an error it records a diagnostic, resynchronizes on
//! the next declaration keyword or closing brace, and keeps going so a
//! single typo does not hide every later finding.

use crate::ast::{
    BinaryOp, CommandDecl, ConstraintDecl, DataType, EmitDecl, EntityDecl, Expr, Literal,
    ParamDecl, Program, PropertyDecl, PropertyModifier, UnaryOp,
};
use crate::diagnostics::{Diagnostic, Span};
use crate::ir::Severity;
use crate::lexer::{tokenize, Token, TokenKind};

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    diagnostics: Vec<Diagnostic>,
}

impl Parser {
    /// Parse source text into a program and its syntax diagnostics.
    pub fn parse(source: &str) -> (Program, Vec<Diagnostic>) {
        let (tokens, mut diagnostics) = tokenize(source);
        let mut parser = Parser {
            tokens,
            pos: 0,
            diagnostics: Vec::new(),
        };
        let program = parser.parse_program();
        diagnostics.append(&mut parser.diagnostics);
        (program, diagnostics)
    }

    // -- token helpers -------------------------------------------------------

    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn peek_at(&self, offset: usize) -> &Token {
        let idx = (self.pos + offset).min(self.tokens.len() - 1);
        &self.tokens[idx]
    }

    fn at_eof(&self) -> bool {
        matches!(self.peek().kind, TokenKind::Eof)
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos].clone();
        if !matches!(token.kind, TokenKind::Eof) {
            self.pos += 1;
        }
        token
    }

    fn check(&self, kind: &TokenKind) -> bool {
        self.peek().kind == *kind
    }

    fn check_ident(&self, text: &str) -> bool {
        matches!(&self.peek().kind, TokenKind::Ident(s) if s == text)
    }

    fn take_ident(&mut self) -> Option<(String, Span)> {
        if let TokenKind::Ident(s) = self.peek().kind.clone() {
            let token = self.advance();
            Some((s, token.span))
        } else {
            None
        }
    }

    fn expect(&mut self, kind: &TokenKind, what: &str) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            let span = self.peek().span;
            self.error(format!("expected {what}"), span);
            false
        }
    }

    fn error(&mut self, message: impl Into<String>, span: Span) {
        self.diagnostics.push(Diagnostic::error(message, span));
    }

    fn prev_end(&self) -> usize {
        self.tokens[self.pos.saturating_sub(1)].span.end
    }

    /// Skip tokens until the next declaration keyword or block edge.
    fn synchronize(&mut self) {
        while !self.at_eof() {
            if self.check(&TokenKind::RBrace)
                || ["entity", "command", "property", "constraint", "emit"]
                    .iter()
                    .any(|kw| self.check_ident(kw))
            {
                return;
            }
            self.advance();
        }
    }

    // -- declarations --------------------------------------------------------

    fn parse_program(&mut self) -> Program {
        let mut program = Program::default();
        while !self.at_eof() {
            if self.check_ident("entity") {
                if let Some(entity) = self.parse_entity() {
                    program.entities.push(entity);
                }
            } else if self.check_ident("command") {
                if let Some(command) = self.parse_command(true) {
                    program.commands.push(command);
                }
            } else {
                let token = self.advance();
                self.error("expected 'entity' or 'command'", token.span);
                self.synchronize();
            }
        }
        program
    }

    fn parse_entity(&mut self) -> Option<EntityDecl> {
        let start = self.advance().span; // 'entity'
        let Some((name, _)) = self.take_ident() else {
            let span = self.peek().span;
            self.error("expected entity name", span);
            self.synchronize();
            return None;
        };
        if !self.expect(&TokenKind::LBrace, "'{' after entity name") {
            self.synchronize();
            return None;
        }

        let mut properties = Vec::new();
        let mut constraints = Vec::new();
        let mut commands = Vec::new();
        loop {
            if self.at_eof() {
                self.error(
                    format!("unexpected end of input inside entity '{name}'"),
                    Span::new(start.start, self.prev_end()),
                );
                break;
            }
            if self.check(&TokenKind::RBrace) {
                self.advance();
                break;
            }
            if self.check_ident("property") {
                if let Some(property) = self.parse_property() {
                    properties.push(property);
                }
            } else if self.check_ident("constraint") {
                if let Some(constraint) = self.parse_constraint() {
                    constraints.push(constraint);
                }
            } else if self.check_ident("command") {
                if let Some(command) = self.parse_command(false) {
                    commands.push(command);
                }
            } else {
                let token = self.advance();
                self.error(
                    "expected 'property', 'constraint', or 'command' in entity block",
                    token.span,
                );
                self.synchronize();
            }
        }

        Some(EntityDecl {
            name,
            properties,
            constraints,
            commands,
            span: Span::new(start.start, self.prev_end()),
        })
    }

    fn parse_property(&mut self) -> Option<PropertyDecl> {
        let start = self.advance().span; // 'property'

        // Idents up to the one followed by ':'. The last is the name,
        // everything before it is a modifier.
        let mut idents: Vec<(String, Span)> = Vec::new();
        loop {
            let Some(ident) = self.take_ident() else {
                let span = self.peek().span;
                self.error("expected property name", span);
                self.synchronize();
                return None;
            };
            idents.push(ident);
            if self.check(&TokenKind::Colon) {
                self.advance();
                break;
            }
            if !matches!(self.peek().kind, TokenKind::Ident(_)) {
                let span = self.peek().span;
                self.error("expected ':' after property name", span);
                self.synchronize();
                return None;
            }
        }

        let (name, _) = idents.pop()?;
        let mut modifiers = Vec::new();
        for (text, span) in idents {
            match PropertyModifier::parse(&text) {
                Some(modifier) => modifiers.push(modifier),
                None => self.error(format!("unknown property modifier '{text}'"), span),
            }
        }

        let Some((type_name, type_span)) = self.take_ident() else {
            let span = self.peek().span;
            self.error("expected property type", span);
            self.synchronize();
            return None;
        };
        let data_type = match DataType::parse(&type_name) {
            Some(t) => t,
            None => {
                self.error(format!("unknown type '{type_name}'"), type_span);
                DataType::String
            }
        };

        let default = if self.check(&TokenKind::Assign) {
            self.advance();
            self.parse_literal()
        } else {
            None
        };

        Some(PropertyDecl {
            name,
            data_type,
            modifiers,
            default,
            span: Span::new(start.start, self.prev_end()),
        })
    }

    fn parse_command(&mut self, top_level: bool) -> Option<CommandDecl> {
        let start = self.advance().span; // 'command'
        let Some((name, _)) = self.take_ident() else {
            let span = self.peek().span;
            self.error("expected command name", span);
            self.synchronize();
            return None;
        };
        if !self.expect(&TokenKind::LParen, "'(' after command name") {
            self.synchronize();
            return None;
        }

        let mut params = Vec::new();
        if !self.check(&TokenKind::RParen) {
            loop {
                match self.parse_param() {
                    Some(param) => params.push(param),
                    None => {
                        self.synchronize();
                        return None;
                    }
                }
                if self.check(&TokenKind::Comma) {
                    self.advance();
                    continue;
                }
                break;
            }
        }
        if !self.expect(&TokenKind::RParen, "')' after parameters") {
            self.synchronize();
            return None;
        }

        let mut owner = None;
        if self.check_ident("for") {
            let for_span = self.advance().span;
            match self.take_ident() {
                Some((entity, _)) => owner = Some(entity),
                None => self.error("expected entity name after 'for'", for_span),
            }
        }
        if top_level && owner.is_none() {
            self.error(
                format!("top-level command '{name}' must declare an owning entity with 'for'"),
                start,
            );
        }
        if !top_level && owner.is_some() {
            self.error(
                format!("command '{name}' is owned by its enclosing entity; remove 'for'"),
                start,
            );
            owner = None;
        }

        if !self.expect(&TokenKind::LBrace, "'{' to open command body") {
            self.synchronize();
            return None;
        }

        let mut constraints = Vec::new();
        let mut emits = Vec::new();
        loop {
            if self.at_eof() {
                self.error(
                    format!("unexpected end of input inside command '{name}'"),
                    Span::new(start.start, self.prev_end()),
                );
                break;
            }
            if self.check(&TokenKind::RBrace) {
                self.advance();
                break;
            }
            if self.check_ident("constraint") {
                if let Some(constraint) = self.parse_constraint() {
                    constraints.push(constraint);
                }
            } else if self.check_ident("emit") {
                if let Some(emit) = self.parse_emit() {
                    emits.push(emit);
                }
            } else {
                let token = self.advance();
                self.error("expected 'constraint' or 'emit' in command body", token.span);
                self.synchronize();
            }
        }

        Some(CommandDecl {
            name,
            owner,
            params,
            constraints,
            emits,
            span: Span::new(start.start, self.prev_end()),
        })
    }

    fn parse_param(&mut self) -> Option<ParamDecl> {
        let mut optional = false;
        if self.check_ident("optional") && matches!(self.peek_at(1).kind, TokenKind::Ident(_)) {
            self.advance();
            optional = true;
        }

        let Some((name, name_span)) = self.take_ident() else {
            let span = self.peek().span;
            self.error("expected parameter name", span);
            return None;
        };
        if !self.expect(&TokenKind::Colon, "':' after parameter name") {
            return None;
        }
        let Some((type_name, type_span)) = self.take_ident() else {
            let span = self.peek().span;
            self.error("expected parameter type", span);
            return None;
        };
        let data_type = match DataType::parse(&type_name) {
            Some(t) => t,
            None => {
                self.error(format!("unknown type '{type_name}'"), type_span);
                DataType::String
            }
        };
        let default = if self.check(&TokenKind::Assign) {
            self.advance();
            self.parse_literal()
        } else {
            None
        };

        Some(ParamDecl {
            name,
            data_type,
            optional,
            default,
            span: Span::new(name_span.start, self.prev_end()),
        })
    }

    fn parse_constraint(&mut self) -> Option<ConstraintDecl> {
        let start = self.advance().span; // 'constraint'
        let Some((name, _)) = self.take_ident() else {
            let span = self.peek().span;
            self.error("expected constraint name", span);
            self.synchronize();
            return None;
        };

        // `name: expr`, `name:severity expr`, or `name expr`
        let mut severity = Severity::Block;
        if self.check(&TokenKind::Colon) {
            self.advance();
            if let TokenKind::Ident(text) = self.peek().kind.clone() {
                if let Some(parsed) = Severity::parse(&text) {
                    severity = parsed;
                    self.advance();
                }
            }
        }

        let Some(expr) = self.parse_expr() else {
            self.synchronize();
            return None;
        };

        let message = if let TokenKind::Str(text) = self.peek().kind.clone() {
            self.advance();
            Some(text)
        } else {
            None
        };

        Some(ConstraintDecl {
            name,
            severity,
            expr,
            message,
            span: Span::new(start.start, self.prev_end()),
        })
    }

    fn parse_emit(&mut self) -> Option<EmitDecl> {
        let start = self.advance().span; // 'emit'
        let Some((first, first_span)) = self.take_ident() else {
            let span = self.peek().span;
            self.error("expected event type after 'emit'", span);
            self.synchronize();
            return None;
        };

        let mut event_type = first;
        let mut end = first_span.end;
        while self.check(&TokenKind::Dot) {
            self.advance();
            let Some((segment, segment_span)) = self.take_ident() else {
                let span = self.peek().span;
                self.error("expected event type segment after '.'", span);
                break;
            };
            event_type.push('.');
            event_type.push_str(&segment);
            end = segment_span.end;
        }

        Some(EmitDecl {
            event_type,
            span: Span::new(start.start, end),
        })
    }

    fn parse_literal(&mut self) -> Option<Literal> {
        match self.peek().kind.clone() {
            TokenKind::Number(n) => {
                self.advance();
                Some(Literal::Number(n))
            }
            TokenKind::Str(s) => {
                self.advance();
                Some(Literal::Str(s))
            }
            TokenKind::Minus => {
                self.advance();
                if let TokenKind::Number(n) = self.peek().kind.clone() {
                    self.advance();
                    Some(Literal::Number(-n))
                } else {
                    let span = self.peek().span;
                    self.error("expected number after '-'", span);
                    None
                }
            }
            TokenKind::Ident(ref s) if s == "true" => {
                self.advance();
                Some(Literal::Bool(true))
            }
            TokenKind::Ident(ref s) if s == "false" => {
                self.advance();
                Some(Literal::Bool(false))
            }
            TokenKind::Ident(ref s) if s == "null" => {
                self.advance();
                Some(Literal::Null)
            }
            _ => {
                let span = self.peek().span;
                self.error("expected literal value", span);
                None
            }
        }
    }

    // -- expressions ---------------------------------------------------------

    fn parse_expr(&mut self) -> Option<Expr> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Option<Expr> {
        let mut left = self.parse_and()?;
        while self.check_ident("or") {
            self.advance();
            let right = self.parse_and()?;
            left = binary(BinaryOp::Or, left, right);
        }
        Some(left)
    }

    fn parse_and(&mut self) -> Option<Expr> {
        let mut left = self.parse_equality()?;
        while self.check_ident("and") {
            self.advance();
            let right = self.parse_equality()?;
            left = binary(BinaryOp::And, left, right);
        }
        Some(left)
    }

    fn parse_equality(&mut self) -> Option<Expr> {
        let mut left = self.parse_comparison()?;
        loop {
            let op = if self.check(&TokenKind::EqEq) {
                BinaryOp::Eq
            } else if self.check(&TokenKind::NotEq) {
                BinaryOp::Ne
            } else {
                break;
            };
            self.advance();
            let right = self.parse_comparison()?;
            left = binary(op, left, right);
        }
        Some(left)
    }

    fn parse_comparison(&mut self) -> Option<Expr> {
        let mut left = self.parse_additive()?;
        loop {
            let op = if self.check(&TokenKind::Lt) {
                BinaryOp::Lt
            } else if self.check(&TokenKind::Gt) {
                BinaryOp::Gt
            } else if self.check(&TokenKind::Le) {
                BinaryOp::Le
            } else if self.check(&TokenKind::Ge) {
                BinaryOp::Ge
            } else if self.check_ident("in") {
                BinaryOp::In
            } else if self.check_ident("contains") {
                BinaryOp::Contains
            } else {
                break;
            };
            self.advance();
            let right = self.parse_additive()?;
            left = binary(op, left, right);
        }
        Some(left)
    }

    fn parse_additive(&mut self) -> Option<Expr> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = if self.check(&TokenKind::Plus) {
                BinaryOp::Add
            } else if self.check(&TokenKind::Minus) {
                BinaryOp::Sub
            } else {
                break;
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = binary(op, left, right);
        }
        Some(left)
    }

    fn parse_multiplicative(&mut self) -> Option<Expr> {
        let mut left = self.parse_unary()?;
        loop {
            let op = if self.check(&TokenKind::Star) {
                BinaryOp::Mul
            } else if self.check(&TokenKind::Slash) {
                BinaryOp::Div
            } else if self.check(&TokenKind::Percent) {
                BinaryOp::Mod
            } else {
                break;
            };
            self.advance();
            let right = self.parse_unary()?;
            left = binary(op, left, right);
        }
        Some(left)
    }

    fn parse_unary(&mut self) -> Option<Expr> {
        if self.check_ident("not") {
            self.advance();
            let operand = self.parse_unary()?;
            return Some(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        if self.check(&TokenKind::Minus) {
            self.advance();
            let operand = self.parse_unary()?;
            return Some(Expr::Unary {
                op: UnaryOp::Neg,
                operand: Box::new(operand),
            });
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Option<Expr> {
        let mut expr = self.parse_primary()?;
        while self.check(&TokenKind::Dot) {
            self.advance();
            let Some((property, _)) = self.take_ident() else {
                let span = self.peek().span;
                self.error("expected property name after '.'", span);
                return None;
            };
            expr = Expr::Member {
                object: Box::new(expr),
                property,
            };
        }
        Some(expr)
    }

    fn parse_primary(&mut self) -> Option<Expr> {
        match self.peek().kind.clone() {
            TokenKind::Number(n) => {
                self.advance();
                Some(Expr::Literal {
                    value: Literal::Number(n),
                })
            }
            TokenKind::Str(s) => {
                self.advance();
                Some(Expr::Literal {
                    value: Literal::Str(s),
                })
            }
            TokenKind::Ident(name) => {
                self.advance();
                match name.as_str() {
                    "true" => Some(Expr::Literal {
                        value: Literal::Bool(true),
                    }),
                    "false" => Some(Expr::Literal {
                        value: Literal::Bool(false),
                    }),
                    "null" => Some(Expr::Literal {
                        value: Literal::Null,
                    }),
                    _ => Some(Expr::Ident { name }),
                }
            }
            TokenKind::LParen => {
                self.advance();
                let expr = self.parse_expr()?;
                self.expect(&TokenKind::RParen, "')' to close expression");
                Some(expr)
            }
            _ => {
                let span = self.peek().span;
                self.error("expected expression", span);
                None
            }
        }
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::has_errors;

    fn parse_ok(source: &str) -> Program {
        let (program, diagnostics) = Parser::parse(source);
        assert!(
            !has_errors(&diagnostics),
            "unexpected errors: {diagnostics:?}"
        );
        program
    }

    #[test]
    fn test_empty_source() {
        let program = parse_ok("");
        assert!(program.entities.is_empty());
        assert!(program.commands.is_empty());
    }

    #[test]
    fn test_minimal_entity() {
        let program = parse_ok("entity PrepTask {}");
        assert_eq!(program.entities.len(), 1);
        assert_eq!(program.entities[0].name, "PrepTask");
    }

    #[test]
    fn test_entity_with_properties() {
        let program = parse_ok(
            r#"
            entity PrepTask {
              property required id: string
              property status: string = "open"
              property quantity: number = 0
              property tags: list
            }
            "#,
        );
        let entity = &program.entities[0];
        assert_eq!(entity.properties.len(), 4);
        assert_eq!(entity.properties[0].modifiers, vec![PropertyModifier::Required]);
        assert_eq!(entity.properties[1].default, Some(Literal::Str("open".to_string())));
        assert_eq!(entity.properties[2].data_type, DataType::Number);
        assert_eq!(entity.properties[3].data_type, DataType::List);
    }

    #[test]
    fn test_multiple_property_modifiers() {
        let program = parse_ok("entity User { property required unique indexed email: string }");
        assert_eq!(
            program.entities[0].properties[0].modifiers,
            vec![
                PropertyModifier::Required,
                PropertyModifier::Unique,
                PropertyModifier::Indexed
            ]
        );
    }

    #[test]
    fn test_nested_command() {
        let program = parse_ok(
            r#"
            entity PrepTask {
              command claim(employeeId: string, optional note: string) {
                constraint notClaimed:block self.claimedBy == "" "Task is already claimed"
                emit kitchen.task.claimed
              }
            }
            "#,
        );
        let command = &program.entities[0].commands[0];
        assert_eq!(command.name, "claim");
        assert!(command.owner.is_none());
        assert_eq!(command.params.len(), 2);
        assert!(command.params[1].optional);
        assert_eq!(command.constraints.len(), 1);
        assert_eq!(command.constraints[0].severity, Severity::Block);
        assert_eq!(
            command.constraints[0].message.as_deref(),
            Some("Task is already claimed")
        );
        assert_eq!(command.emits[0].event_type, "kitchen.task.claimed");
    }

    #[test]
    fn test_top_level_command_with_for() {
        let program = parse_ok(
            r#"
            entity InventoryItem {}
            command adjustStock(delta: number) for InventoryItem {
              constraint nonNegative:fatal self.onHand + delta >= 0
              emit inventory.stock.adjusted
            }
            "#,
        );
        assert_eq!(program.commands.len(), 1);
        assert_eq!(program.commands[0].owner.as_deref(), Some("InventoryItem"));
        assert_eq!(program.commands[0].constraints[0].severity, Severity::Fatal);
    }

    #[test]
    fn test_top_level_command_without_for_is_an_error() {
        let (_, diagnostics) = Parser::parse("command orphan() {}");
        assert!(has_errors(&diagnostics));
        assert!(diagnostics
            .iter()
            .any(|d| d.message.contains("owning entity")));
    }

    #[test]
    fn test_nested_command_with_for_is_an_error() {
        let (_, diagnostics) =
            Parser::parse("entity Task { command claim() for Task {} }");
        assert!(has_errors(&diagnostics));
    }

    #[test]
    fn test_constraint_severity_defaults_to_block() {
        let program = parse_ok("entity User { constraint adult: self.age >= 18 }");
        assert_eq!(program.entities[0].constraints[0].severity, Severity::Block);
    }

    #[test]
    fn test_constraint_severities() {
        let program = parse_ok(
            r#"
            entity Order {
              constraint a:info self.total >= 0
              constraint b:warn self.total < 10000
              constraint c:block self.total < 100000
              constraint d:fatal self.total < 1000000
            }
            "#,
        );
        let severities: Vec<Severity> = program.entities[0]
            .constraints
            .iter()
            .map(|c| c.severity)
            .collect();
        assert_eq!(
            severities,
            vec![Severity::Info, Severity::Warn, Severity::Block, Severity::Fatal]
        );
    }

    #[test]
    fn test_expression_precedence() {
        let program = parse_ok("entity T { constraint x: a + b * c == d and not e }");
        // ((a + (b * c)) == d) and (not e)
        let Expr::Binary { op, left, right } = &program.entities[0].constraints[0].expr else {
            panic!("expected binary expr");
        };
        assert_eq!(*op, BinaryOp::And);
        assert!(matches!(
            left.as_ref(),
            Expr::Binary { op: BinaryOp::Eq, .. }
        ));
        assert!(matches!(
            right.as_ref(),
            Expr::Unary { op: UnaryOp::Not, .. }
        ));
    }

    #[test]
    fn test_member_chain() {
        let program = parse_ok("entity T { constraint x: self.order.total > 0 }");
        let Expr::Binary { left, .. } = &program.entities[0].constraints[0].expr else {
            panic!("expected binary expr");
        };
        let Expr::Member { object, property } = left.as_ref() else {
            panic!("expected member expr");
        };
        assert_eq!(property, "total");
        assert!(matches!(object.as_ref(), Expr::Member { .. }));
    }

    #[test]
    fn test_in_and_contains() {
        let program = parse_ok(
            r#"entity T {
              constraint a: status in self.allowed
              constraint b: self.tags contains "rush"
            }"#,
        );
        assert!(matches!(
            program.entities[0].constraints[0].expr,
            Expr::Binary { op: BinaryOp::In, .. }
        ));
        assert!(matches!(
            program.entities[0].constraints[1].expr,
            Expr::Binary {
                op: BinaryOp::Contains,
                ..
            }
        ));
    }

    #[test]
    fn test_parenthesized_expression() {
        let program = parse_ok("entity T { constraint x: (a + b) * c > 0 }");
        let Expr::Binary { left, .. } = &program.entities[0].constraints[0].expr else {
            panic!("expected binary expr");
        };
        assert!(matches!(
            left.as_ref(),
            Expr::Binary { op: BinaryOp::Mul, .. }
        ));
    }

    #[test]
    fn test_recovery_after_bad_declaration() {
        let (program, diagnostics) = Parser::parse(
            r#"
            entity Good {}
            bogus tokens here
            entity AlsoGood {}
            "#,
        );
        assert!(has_errors(&diagnostics));
        assert_eq!(program.entities.len(), 2);
    }

    #[test]
    fn test_unterminated_entity_block() {
        let (_, diagnostics) = Parser::parse("entity Task { property id: string");
        assert!(has_errors(&diagnostics));
        assert!(diagnostics
            .iter()
            .any(|d| d.message.contains("end of input")));
    }
}
