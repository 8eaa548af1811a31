//! Two-pass parser.
//!
//! The first pass only registers the names of top-level declarations so that
//! the second pass, which builds the full tree, can resolve forward references.

mod expressions;
mod statements;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::ast::{Block, Body, ProgramUnit, INITIALIZATION_NAME, OPERATION_NAME};
use crate::error::{DiagnosticKind, Diagnostics, Position};
use crate::hold_state::{self, HoldState};
use crate::lexer::{Keyword, Symbol, Token, TokenKind, TokenStream};
use crate::library::Library;
use crate::options::CompileOptions;
use crate::symbol_table::{self, DuplicateSymbol, ScopeId, ScopeKind, SymbolId, SymbolKind, SymbolTable};
use crate::types::{ArrayType, NumericKind, StructType, TypeData};

pub struct Parser<'a> {
    tokens: TokenStream,
    table: SymbolTable,
    diagnostics: Diagnostics,
    options: &'a CompileOptions,
    linked_units: Vec<Arc<Library>>,
    /// Declaration keyword index -> symbol registered for it by the first pass.
    declarations: HashMap<usize, SymbolId>,
}

fn is_declaration_start(token: &Token) -> bool {
    matches!(
        token.kind,
        TokenKind::Keyword(
            Keyword::Stage
                | Keyword::Param
                | Keyword::Func
                | Keyword::Struct
                | Keyword::Init
                | Keyword::Operation
        )
    )
}

/// Empty-bodied symbol registered for a declaration before its body is parsed.
fn placeholder(keyword: Keyword, name: &str, position: Position) -> symbol_table::Symbol {
    let (kind, ty) = match keyword {
        Keyword::Stage => (
            SymbolKind::Stage {
                hold: HoldState::FullHistory,
            },
            None,
        ),
        Keyword::Param => (SymbolKind::Parameter { body: None }, None),
        Keyword::Func => (
            SymbolKind::Function {
                params: Vec::new(),
                body: None,
                scope: None,
            },
            None,
        ),
        Keyword::Struct => (SymbolKind::Struct { fields: Vec::new() }, None),
        Keyword::Init => (SymbolKind::Initialization { body: None }, Some(TypeData::Nothing)),
        Keyword::Operation => (SymbolKind::Operation { body: None }, Some(TypeData::Nothing)),
        other => unreachable!("'{}' does not start a declaration", other.as_str()),
    };
    symbol_table::Symbol::new(name, kind, ty, position)
}

impl<'a> Parser<'a> {
    pub fn new(tokens: TokenStream, options: &'a CompileOptions) -> Self {
        let linked_units = if options.use_builtin_methods {
            vec![Library::standard()]
        } else {
            Vec::new()
        };

        Self {
            tokens,
            table: SymbolTable::new(),
            diagnostics: Diagnostics::new(),
            options,
            linked_units,
            declarations: HashMap::new(),
        }
    }

    /// Links an additional external unit; it is searched after the ones already linked.
    pub fn link(&mut self, unit: Arc<Library>) {
        self.linked_units.push(unit);
    }

    pub fn parse(mut self) -> (ProgramUnit, Diagnostics) {
        self.gather_declarations();
        debug!(
            symbols = self.table.symbol_count(),
            "top-level declarations gathered"
        );

        self.parse_declarations();
        self.ensure_entry_points();
        debug!(
            symbols = self.table.symbol_count(),
            errors = self.diagnostics.errors().count(),
            "parsing finished"
        );

        (
            ProgramUnit::new(self.table, self.linked_units),
            self.diagnostics,
        )
    }

    // Pass 1

    fn gather_declarations(&mut self) {
        self.tokens.reset();

        while !self.tokens.is_at_end() {
            let index = self.tokens.cursor();
            let token = self.tokens.read();
            let TokenKind::Keyword(keyword) = token.kind else {
                continue;
            };

            let (name, position) = match keyword {
                Keyword::Stage | Keyword::Param | Keyword::Func | Keyword::Struct => {
                    let next = self.tokens.peek();
                    match next.identifier() {
                        Some(name) => (name.to_string(), next.position),
                        None => continue,
                    }
                }
                Keyword::Init => (INITIALIZATION_NAME.to_string(), token.position),
                Keyword::Operation => (OPERATION_NAME.to_string(), token.position),
                _ => continue,
            };

            let global = self.table.global_scope();
            match self.register(global, keyword, &name, position) {
                Ok(id) => {
                    self.declarations.insert(index, id);
                }
                Err(_) => {
                    let message = match keyword {
                        Keyword::Init | Keyword::Operation => {
                            format!("only one '{}' block is allowed", keyword.as_str())
                        }
                        _ => format!("'{}' is already declared", name),
                    };
                    self.error(DiagnosticKind::Name, position, message);
                }
            }
        }
    }

    fn register(
        &mut self,
        scope: ScopeId,
        keyword: Keyword,
        name: &str,
        position: Position,
    ) -> Result<SymbolId, DuplicateSymbol> {
        let id = self
            .table
            .define_in(scope, placeholder(keyword, name, position))?;
        if keyword == Keyword::Struct {
            self.table.symbol_mut(id).ty = Some(TypeData::Struct(StructType {
                name: name.to_string(),
                symbol: id,
            }));
        }
        Ok(id)
    }

    /// The symbol the first pass registered for the declaration starting at
    /// `index`. Rejected duplicates get a detached symbol so their bodies are
    /// still parsed and checked.
    fn declared_symbol(&mut self, index: usize, keyword: Keyword, name: &str, position: Position) -> SymbolId {
        if let Some(id) = self.declarations.get(&index) {
            return *id;
        }

        let detached = self.table.enter_scope(ScopeKind::Block);
        self.table.exit_scope();
        match self.register(detached, keyword, name, position) {
            Ok(id) | Err(DuplicateSymbol { existing: id, .. }) => id,
        }
    }

    // Pass 2

    fn parse_declarations(&mut self) {
        self.tokens.reset();

        while !self.tokens.is_at_end() {
            let token = self.tokens.peek().clone();
            match token.kind {
                TokenKind::Keyword(Keyword::Stage) => self.parse_stage(),
                TokenKind::Keyword(Keyword::Param) => self.parse_parameter(),
                TokenKind::Keyword(Keyword::Func) => self.parse_function(),
                TokenKind::Keyword(Keyword::Struct) => self.parse_struct(),
                TokenKind::Keyword(keyword @ (Keyword::Init | Keyword::Operation)) => {
                    self.parse_routine(keyword)
                }
                TokenKind::Invalid => {
                    self.tokens.read();
                }
                _ => {
                    self.error(
                        DiagnosticKind::Syntax,
                        token.position,
                        format!("expected a declaration, found {}", token.kind),
                    );
                    self.tokens.read();
                    self.synchronize_declaration();
                }
            }
        }
    }

    /// Reads the keyword and name of a declaration and returns its symbol.
    fn declaration_header(&mut self, keyword: Keyword) -> Option<(SymbolId, String, Position)> {
        let index = self.tokens.cursor();
        self.tokens.read();
        let Some((name, position)) = self.expect_identifier() else {
            self.synchronize_declaration();
            return None;
        };
        let id = self.declared_symbol(index, keyword, &name, position);
        Some((id, name, position))
    }

    fn parse_stage(&mut self) {
        let Some((id, name, position)) = self.declaration_header(Keyword::Stage) else {
            return;
        };

        let ty = if self.expect_keyword(Keyword::As) {
            self.parse_type()
        } else {
            TypeData::Invalid
        };

        let mut hold = HoldState::FullHistory;
        if self.match_keyword(Keyword::Holds) {
            let token = self.tokens.read();
            match token.kind {
                TokenKind::IntegerLiteral(window) if window >= 0 => match HoldState::partial(window) {
                    Some(partial) => hold = partial,
                    None => self.error(
                        DiagnosticKind::Syntax,
                        token.position,
                        format!(
                            "history length {} is too large, the limit is {}",
                            window,
                            hold_state::MAX_WINDOW
                        ),
                    ),
                },
                other => self.error(
                    DiagnosticKind::Syntax,
                    token.position,
                    format!("expected a history length after 'holds', found {}", other),
                ),
            }
        }

        if !self.expect_symbol(Symbol::Semicolon) {
            self.synchronize_declaration();
        }

        match &ty {
            TypeData::Array(array) if !array.is_sized() => self.error(
                DiagnosticKind::Type,
                position,
                format!("stage '{}' needs a size for every array dimension", name),
            ),
            TypeData::Nothing => self.error(
                DiagnosticKind::Type,
                position,
                format!("stage '{}' cannot hold 'nothing'", name),
            ),
            _ => {}
        }

        let symbol = self.table.symbol_mut(id);
        symbol.kind = SymbolKind::Stage { hold };
        symbol.ty = Some(ty);
    }

    fn parse_parameter(&mut self) {
        let Some((id, name, position)) = self.declaration_header(Keyword::Param) else {
            return;
        };

        let declared = if self.match_keyword(Keyword::As) {
            Some(self.parse_type())
        } else {
            None
        };

        let body = if self.match_symbol(Symbol::Semicolon) {
            None
        } else if self.match_symbol(Symbol::Equals) {
            self.table.enter_scope(ScopeKind::Parameter { name: name.clone() });
            let expression = self.parse_expression();
            self.table.exit_scope();
            self.expect_declaration_end();
            Some(Body::Expression(expression))
        } else if self.check_symbol(Symbol::LeftBrace) {
            let scope = self.table.enter_scope(ScopeKind::Parameter { name: name.clone() });
            let block = self.parse_block_body(scope);
            self.table.exit_scope();
            Some(Body::Block(block))
        } else {
            self.unexpected("'=', '{' or ';'");
            self.synchronize_declaration();
            None
        };

        let ty = match (declared, &body) {
            (Some(ty), _) => Some(ty),
            // External parameters are approximate reals unless annotated.
            (None, None) => Some(TypeData::FLOAT64),
            (None, Some(Body::Block(_))) => {
                self.error(
                    DiagnosticKind::Syntax,
                    position,
                    format!("parameter '{}' has a block body and needs 'as TYPE'", name),
                );
                Some(TypeData::Invalid)
            }
            (None, Some(Body::Expression(_))) => None,
        };

        let symbol = self.table.symbol_mut(id);
        symbol.kind = SymbolKind::Parameter { body };
        symbol.ty = ty;
    }

    fn parse_function(&mut self) {
        let Some((id, name, position)) = self.declaration_header(Keyword::Func) else {
            return;
        };

        let scope = self.table.enter_scope(ScopeKind::Function { name: name.clone() });
        let mut params = Vec::new();
        if self.expect_symbol(Symbol::LeftParen) {
            if !self.check_symbol(Symbol::RightParen) {
                loop {
                    let Some((param_name, param_position)) = self.expect_identifier() else {
                        break;
                    };
                    let ty = if self.match_keyword(Keyword::As) {
                        self.parse_type()
                    } else {
                        TypeData::FLOAT64
                    };
                    let param = symbol_table::Symbol::new(
                        param_name,
                        SymbolKind::FunctionParameter,
                        Some(ty),
                        param_position,
                    );
                    match self.table.define(param) {
                        Ok(param_id) => params.push(param_id),
                        Err(duplicate) => self.error(
                            DiagnosticKind::Name,
                            param_position,
                            format!(
                                "duplicate parameter '{}' in function '{}'",
                                duplicate.name, name
                            ),
                        ),
                    }
                    if !self.match_symbol(Symbol::Comma) {
                        break;
                    }
                }
            }
            self.expect_symbol(Symbol::RightParen);
        }

        let declared = if self.match_keyword(Keyword::As) {
            Some(self.parse_type())
        } else {
            None
        };

        let body = if self.match_symbol(Symbol::Equals) {
            let expression = self.parse_expression();
            self.expect_declaration_end();
            Some(Body::Expression(expression))
        } else if self.check_symbol(Symbol::LeftBrace) {
            let block_scope = self.table.enter_scope(ScopeKind::Block);
            let block = self.parse_block_body(block_scope);
            self.table.exit_scope();
            Some(Body::Block(block))
        } else {
            self.unexpected("'=' or '{'");
            self.synchronize_declaration();
            None
        };
        self.table.exit_scope();

        let ty = match (declared, &body) {
            (Some(ty), _) => Some(ty),
            (None, Some(Body::Expression(_))) => None,
            (None, Some(Body::Block(_))) => {
                self.error(
                    DiagnosticKind::Syntax,
                    position,
                    format!("expected 'as' with the return type of function '{}'", name),
                );
                Some(TypeData::Invalid)
            }
            (None, None) => Some(TypeData::Invalid),
        };

        let symbol = self.table.symbol_mut(id);
        symbol.kind = SymbolKind::Function {
            params,
            body,
            scope: Some(scope),
        };
        symbol.ty = ty;
    }

    fn parse_struct(&mut self) {
        let Some((id, name, _)) = self.declaration_header(Keyword::Struct) else {
            return;
        };

        if !self.expect_symbol(Symbol::Equals) || !self.expect_symbol(Symbol::LeftParen) {
            self.synchronize_declaration();
            return;
        }

        self.table.enter_scope(ScopeKind::Struct { name: name.clone() });
        let mut fields = Vec::new();
        if !self.check_symbol(Symbol::RightParen) {
            loop {
                let Some((field_name, field_position)) = self.expect_identifier() else {
                    break;
                };
                let ty = if self.match_keyword(Keyword::As) {
                    self.parse_type()
                } else {
                    TypeData::FLOAT64
                };
                if !matches!(ty, TypeData::Numeric(_) | TypeData::Struct(_) | TypeData::Invalid) {
                    self.error(
                        DiagnosticKind::Type,
                        field_position,
                        format!("field '{}' of struct '{}' cannot have type {}", field_name, name, ty),
                    );
                }
                let field = symbol_table::Symbol::new(
                    field_name,
                    SymbolKind::Field,
                    Some(ty),
                    field_position,
                );
                match self.table.define(field) {
                    Ok(field_id) => fields.push(field_id),
                    Err(duplicate) => self.error(
                        DiagnosticKind::Name,
                        field_position,
                        format!("duplicate field '{}' in struct '{}'", duplicate.name, name),
                    ),
                }
                if !self.match_symbol(Symbol::Comma) {
                    break;
                }
            }
        }
        self.table.exit_scope();

        self.expect_symbol(Symbol::RightParen);
        self.expect_declaration_end();

        self.table.symbol_mut(id).kind = SymbolKind::Struct { fields };
    }

    /// `init { ... }` and `operation { ... }`.
    fn parse_routine(&mut self, keyword: Keyword) {
        let index = self.tokens.cursor();
        let token = self.tokens.read();
        let (name, scope_kind) = match keyword {
            Keyword::Init => (INITIALIZATION_NAME, ScopeKind::Initialization),
            _ => (OPERATION_NAME, ScopeKind::Operation),
        };
        let id = self.declared_symbol(index, keyword, name, token.position);

        let scope = self.table.enter_scope(scope_kind);
        let block = self.parse_block_body(scope);
        self.table.exit_scope();

        self.table.symbol_mut(id).kind = match keyword {
            Keyword::Init => SymbolKind::Initialization { body: Some(block) },
            _ => SymbolKind::Operation { body: Some(block) },
        };
    }

    /// A program without `init` or `operation` behaves as if it declared empty ones.
    fn ensure_entry_points(&mut self) {
        for keyword in [Keyword::Init, Keyword::Operation] {
            let (name, scope_kind) = match keyword {
                Keyword::Init => (INITIALIZATION_NAME, ScopeKind::Initialization),
                _ => (OPERATION_NAME, ScopeKind::Operation),
            };
            if self.table.lookup_global(name).is_some() {
                continue;
            }

            let scope = self.table.enter_scope(scope_kind);
            self.table.exit_scope();
            let mut symbol = placeholder(keyword, name, Position::INVALID);
            symbol.kind = match keyword {
                Keyword::Init => SymbolKind::Initialization {
                    body: Some(Block::new(scope)),
                },
                _ => SymbolKind::Operation {
                    body: Some(Block::new(scope)),
                },
            };
            if self.table.define(symbol).is_err() {
                unreachable!("'{}' was checked to be undeclared", name);
            }
        }
    }

    // Types

    pub(crate) fn parse_type(&mut self) -> TypeData {
        let token = self.tokens.peek().clone();
        let base = match &token.kind {
            TokenKind::Keyword(keyword) => match keyword {
                Keyword::Bool => TypeData::BOOL,
                Keyword::SByte => TypeData::Numeric(NumericKind::SByte),
                Keyword::UByte => TypeData::Numeric(NumericKind::UByte),
                Keyword::Int => TypeData::INT32,
                Keyword::Long => TypeData::INT64,
                Keyword::Float => TypeData::FLOAT64,
                Keyword::Nothing => TypeData::Nothing,
                _ => {
                    self.unexpected("a type");
                    return TypeData::Invalid;
                }
            },
            TokenKind::Identifier(name) => match self.table.lookup_global(name) {
                Some(id) if matches!(self.table.symbol(id).kind, SymbolKind::Struct { .. }) => {
                    self.table.symbol(id).ty.clone().unwrap_or(TypeData::Invalid)
                }
                _ => {
                    self.error(
                        DiagnosticKind::Type,
                        token.position,
                        format!("unknown type '{}'", name),
                    );
                    TypeData::Invalid
                }
            },
            _ => {
                self.unexpected("a type");
                return TypeData::Invalid;
            }
        };
        self.tokens.read();

        if !self.match_symbol(Symbol::LeftBracket) {
            return base;
        }

        let mut dimensions = Vec::new();
        loop {
            if self.check_symbol(Symbol::RightBracket) || self.check_symbol(Symbol::Comma) {
                dimensions.push(None);
            } else {
                dimensions.push(Some(self.parse_expression()));
            }
            if !self.match_symbol(Symbol::Comma) {
                break;
            }
        }
        self.expect_symbol(Symbol::RightBracket);

        ArrayType::from_dimensions(base, dimensions)
    }

    // Blocks

    /// Parses `{ STATEMENTS }` into `scope`, which the caller has already entered.
    fn parse_block_body(&mut self, scope: ScopeId) -> Block {
        let mut block = Block::new(scope);
        if !self.expect_symbol(Symbol::LeftBrace) {
            return block;
        }

        while !self.check_symbol(Symbol::RightBrace)
            && !self.tokens.is_at_end()
            && !is_declaration_start(self.tokens.peek())
        {
            let start = self.tokens.cursor();
            let statement = self.parse_statement();
            block.statements.push(statement);
            if self.tokens.cursor() == start {
                self.tokens.read();
            }
        }

        self.expect_symbol(Symbol::RightBrace);
        block
    }

    // Token helpers

    fn error(&mut self, kind: DiagnosticKind, position: Position, message: impl Into<String>) {
        self.diagnostics.error(kind, position, message);
    }

    fn peek_position(&self) -> Position {
        self.tokens.peek().position
    }

    fn check_symbol(&self, symbol: Symbol) -> bool {
        self.tokens.peek().is_symbol(symbol)
    }

    fn check_keyword(&self, keyword: Keyword) -> bool {
        self.tokens.peek().is_keyword(keyword)
    }

    fn match_symbol(&mut self, symbol: Symbol) -> bool {
        if self.check_symbol(symbol) {
            self.tokens.read();
            true
        } else {
            false
        }
    }

    fn match_keyword(&mut self, keyword: Keyword) -> bool {
        if self.check_keyword(keyword) {
            self.tokens.read();
            true
        } else {
            false
        }
    }

    fn unexpected(&mut self, expected: &str) {
        let token = self.tokens.peek().clone();
        self.error(
            DiagnosticKind::Syntax,
            token.position,
            format!("expected {}, found {}", expected, token.kind),
        );
    }

    fn expect_symbol(&mut self, symbol: Symbol) -> bool {
        if self.match_symbol(symbol) {
            return true;
        }
        self.unexpected(&format!("'{}'", symbol.as_str()));
        false
    }

    fn expect_keyword(&mut self, keyword: Keyword) -> bool {
        if self.match_keyword(keyword) {
            return true;
        }
        self.unexpected(&format!("'{}'", keyword.as_str()));
        false
    }

    fn expect_identifier(&mut self) -> Option<(String, Position)> {
        let token = self.tokens.peek();
        match token.identifier() {
            Some(name) => {
                let result = (name.to_string(), token.position);
                self.tokens.read();
                Some(result)
            }
            None => {
                self.unexpected("an identifier");
                None
            }
        }
    }

    fn expect_declaration_end(&mut self) {
        if !self.expect_symbol(Symbol::Semicolon) {
            self.synchronize_declaration();
        }
    }

    fn synchronize_declaration(&mut self) {
        while !self.tokens.is_at_end() && !is_declaration_start(self.tokens.peek()) {
            self.tokens.read();
        }
    }

    /// Skips to the next statement boundary: past a `;`, or up to a `}` or a
    /// top-level declaration.
    fn synchronize(&mut self) {
        while !self.tokens.is_at_end() {
            let token = self.tokens.peek();
            if token.is_symbol(Symbol::RightBrace) || is_declaration_start(token) {
                return;
            }
            if self.tokens.read().is_symbol(Symbol::Semicolon) {
                return;
            }
        }
    }
}

/// Lexes and parses `source` with the given options.
pub fn parse_source(source: &str, options: &CompileOptions) -> (ProgramUnit, Diagnostics) {
    let (tokens, mut diagnostics) = crate::lexer::lex(source);
    let (unit, parse_diagnostics) = Parser::new(tokens, options).parse();
    diagnostics.extend(parse_diagnostics);
    (unit, diagnostics)
}
