use std::rc::Rc;

use crate::ast::*;
use crate::lexer::{self, Numeral, Token};

/// Deepest allowed nesting of blocks and expressions.
pub const MAX_NESTING: usize = 150;

pub struct Parser {
    tokens: Vec<(Token, Span)>,
    pos: usize,
    source: Rc<ChunkInfo>,
    functions: Vec<FnState>,
    depth: usize,
}

/// Per-function parse state: whether `...` is legal and how many loops enclose us.
struct FnState {
    is_vararg: bool,
    loops: usize,
}

#[derive(Debug, thiserror::Error)]
#[error("{chunk}:{line}: {message}")]
pub struct ParseError {
    pub code: &'static str,
    pub chunk: String,
    pub line: usize,
    pub span: Span,
    pub message: String,
}

type Result<T> = std::result::Result<T, ParseError>;

/// Lex and parse `source` into a chunk named `chunk_name`.
pub fn compile(source: &str, chunk_name: &str) -> Result<Chunk> {
    let info = Rc::new(ChunkInfo::new(chunk_name, source));
    let tokens = lexer::lex(source).map_err(|e| ParseError {
        code: "MB-L001",
        chunk: chunk_name.to_string(),
        line: e.line,
        span: Span { start: e.position, end: e.position + e.snippet.len() },
        message: format!("unexpected '{}' ({})", e.snippet, e.suggestion),
    })?;
    Parser::new(tokens, info).parse_chunk()
}

impl Parser {
    pub fn new(tokens: Vec<(Token, Span)>, source: Rc<ChunkInfo>) -> Self {
        Parser { tokens, pos: 0, source, functions: Vec::new(), depth: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn peek_span(&self) -> Span {
        self.tokens
            .get(self.pos)
            .map(|(_, s)| *s)
            .or_else(|| self.tokens.last().map(|(_, s)| Span { start: s.end, end: s.end }))
            .unwrap_or(Span::UNKNOWN)
    }

    fn prev_span(&self) -> Span {
        self.pos
            .checked_sub(1)
            .and_then(|i| self.tokens.get(i))
            .map(|(_, s)| *s)
            .unwrap_or(Span::UNKNOWN)
    }

    fn token_at(&self, idx: usize) -> Option<&Token> {
        self.tokens.get(idx).map(|(t, _)| t)
    }

    fn advance(&mut self) -> Option<&Token> {
        let tok = self.tokens.get(self.pos).map(|(t, _)| t);
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn check(&self, expected: &Token) -> bool {
        self.peek() == Some(expected)
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.check(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token) -> Result<Span> {
        match self.peek() {
            Some(tok) if tok == expected => {
                let span = self.peek_span();
                self.advance();
                Ok(span)
            }
            Some(tok) => Err(self.error("MB-P001", format!("expected {:?}, got {:?}", expected, tok))),
            None => Err(self.error("MB-P002", format!("expected {:?}, got <eof>", expected))),
        }
    }

    fn expect_name(&mut self) -> Result<String> {
        match self.peek().cloned() {
            Some(Token::Name(name)) => {
                self.advance();
                Ok(name)
            }
            Some(tok) => Err(self.error("MB-P003", format!("expected name, got {:?}", tok))),
            None => Err(self.error("MB-P003", "expected name, got <eof>".into())),
        }
    }

    fn error(&self, code: &'static str, message: String) -> ParseError {
        let span = self.peek_span();
        ParseError {
            code,
            chunk: self.source.name.clone(),
            line: self.source.line_of(span),
            span,
            message,
        }
    }

    fn enter(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(self.error("MB-P008", "chunk has too many syntax levels".into()));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    fn in_vararg_function(&self) -> bool {
        self.functions.last().is_some_and(|f| f.is_vararg)
    }

    fn block_follows(&self) -> bool {
        matches!(self.peek(), None | Some(Token::End | Token::Else | Token::Elseif | Token::Until))
    }

    // ---- Chunk and blocks ----

    pub fn parse_chunk(mut self) -> Result<Chunk> {
        self.functions.push(FnState { is_vararg: true, loops: 0 });
        let block = self.parse_block()?;
        if let Some(tok) = self.peek() {
            return Err(self.error("MB-P009", format!("'<eof>' expected, got {:?}", tok)));
        }
        Ok(Chunk {
            name: self.source.name.clone(),
            body: Rc::new(FuncBody {
                params: Vec::new(),
                is_vararg: true,
                block,
                source: self.source.clone(),
            }),
        })
    }

    fn parse_block(&mut self) -> Result<Block> {
        self.enter()?;
        let mut stmts = Vec::new();
        while !self.block_follows() {
            if self.check(&Token::Return) {
                let start = self.peek_span();
                self.advance();
                let values = if self.block_follows() || self.check(&Token::Semicolon) {
                    Vec::new()
                } else {
                    self.parse_exprlist()?
                };
                self.eat(&Token::Semicolon);
                if !self.block_follows() {
                    return Err(self.error("MB-P009", "'end' expected after return".into()));
                }
                stmts.push(Spanned::new(Stmt::Return(values), start.merge(self.prev_span())));
                break;
            }
            if let Some(stmt) = self.parse_statement()? {
                stmts.push(stmt);
            }
        }
        self.leave();
        Ok(stmts)
    }

    fn parse_loop_body(&mut self) -> Result<Block> {
        if let Some(f) = self.functions.last_mut() {
            f.loops += 1;
        }
        let block = self.parse_block();
        if let Some(f) = self.functions.last_mut() {
            f.loops -= 1;
        }
        block
    }

    // ---- Statements ----

    fn parse_statement(&mut self) -> Result<Option<Spanned<Stmt>>> {
        let start = self.peek_span();
        let stmt = match self.peek() {
            Some(Token::Semicolon) => {
                self.advance();
                return Ok(None);
            }
            Some(Token::If) => self.parse_if()?,
            Some(Token::While) => {
                self.advance();
                let condition = self.parse_expr()?;
                self.expect(&Token::Do)?;
                let body = self.parse_loop_body()?;
                self.expect(&Token::End)?;
                Stmt::While { condition, body }
            }
            Some(Token::Do) => {
                self.advance();
                let body = self.parse_block()?;
                self.expect(&Token::End)?;
                Stmt::Do(body)
            }
            Some(Token::For) => self.parse_for()?,
            Some(Token::Repeat) => {
                self.advance();
                let body = self.parse_loop_body()?;
                self.expect(&Token::Until)?;
                let condition = self.parse_expr()?;
                Stmt::Repeat { body, condition }
            }
            Some(Token::Function) => self.parse_function_stmt()?,
            Some(Token::Local) => {
                self.advance();
                if self.eat(&Token::Function) {
                    let name = self.expect_name()?;
                    let body = self.parse_body(false)?;
                    Stmt::LocalFunction { name, body }
                } else {
                    let names = self.parse_namelist()?;
                    let values = if self.eat(&Token::Assign) {
                        self.parse_exprlist()?
                    } else {
                        Vec::new()
                    };
                    Stmt::Local { names, values }
                }
            }
            Some(Token::Break) => {
                if self.functions.last().is_none_or(|f| f.loops == 0) {
                    return Err(self.error("MB-P007", "break outside a loop".into()));
                }
                self.advance();
                Stmt::Break
            }
            _ => self.parse_expr_stmt()?,
        };
        Ok(Some(Spanned::new(stmt, start.merge(self.prev_span()))))
    }

    fn parse_if(&mut self) -> Result<Stmt> {
        self.expect(&Token::If)?;
        let mut branches = Vec::new();
        let condition = self.parse_expr()?;
        self.expect(&Token::Then)?;
        branches.push((condition, self.parse_block()?));

        let mut otherwise = None;
        loop {
            if self.eat(&Token::Elseif) {
                let condition = self.parse_expr()?;
                self.expect(&Token::Then)?;
                branches.push((condition, self.parse_block()?));
            } else if self.eat(&Token::Else) {
                otherwise = Some(self.parse_block()?);
                self.expect(&Token::End)?;
                break;
            } else {
                self.expect(&Token::End)?;
                break;
            }
        }
        Ok(Stmt::If { branches, otherwise })
    }

    fn parse_for(&mut self) -> Result<Stmt> {
        self.expect(&Token::For)?;
        let first = self.expect_name()?;

        if self.eat(&Token::Assign) {
            let start = self.parse_expr()?;
            self.expect(&Token::Comma)?;
            let limit = self.parse_expr()?;
            let step = if self.eat(&Token::Comma) { Some(self.parse_expr()?) } else { None };
            self.expect(&Token::Do)?;
            let body = self.parse_loop_body()?;
            self.expect(&Token::End)?;
            return Ok(Stmt::NumericFor { var: first, start, limit, step, body });
        }

        let mut names = vec![first];
        while self.eat(&Token::Comma) {
            names.push(self.expect_name()?);
        }
        self.expect(&Token::In)?;
        let exprs = self.parse_exprlist()?;
        self.expect(&Token::Do)?;
        let body = self.parse_loop_body()?;
        self.expect(&Token::End)?;
        Ok(Stmt::GenericFor { names, exprs, body })
    }

    /// `function a.b.c:m(params) body end`
    fn parse_function_stmt(&mut self) -> Result<Stmt> {
        self.expect(&Token::Function)?;
        let mut target = Expr::Name(self.expect_name()?);
        while self.eat(&Token::Dot) {
            let key = self.expect_name()?;
            target = Expr::Index { object: Box::new(target), key: Box::new(Expr::String(key)) };
        }
        let method = self.eat(&Token::Colon);
        if method {
            let key = self.expect_name()?;
            target = Expr::Index { object: Box::new(target), key: Box::new(Expr::String(key)) };
        }
        let body = self.parse_body(method)?;
        Ok(Stmt::Function { target, body })
    }

    fn parse_expr_stmt(&mut self) -> Result<Stmt> {
        let expr = self.parse_suffixed()?;
        if self.check(&Token::Assign) || self.check(&Token::Comma) {
            let mut targets = vec![self.assignable(expr)?];
            while self.eat(&Token::Comma) {
                let next = self.parse_suffixed()?;
                targets.push(self.assignable(next)?);
            }
            self.expect(&Token::Assign)?;
            let values = self.parse_exprlist()?;
            return Ok(Stmt::Assign { targets, values });
        }
        match expr {
            Expr::Call { .. } | Expr::Method { .. } => Ok(Stmt::Call(expr)),
            _ => Err(self.error("MB-P005", "syntax error: expected assignment or call".into())),
        }
    }

    fn assignable(&self, expr: Expr) -> Result<Expr> {
        match expr {
            Expr::Name(_) | Expr::Index { .. } => Ok(expr),
            _ => Err(self.error("MB-P010", "cannot assign to this expression".into())),
        }
    }

    fn parse_body(&mut self, method: bool) -> Result<Rc<FuncBody>> {
        self.expect(&Token::LParen)?;
        let mut params = if method { vec!["self".to_string()] } else { Vec::new() };
        let mut is_vararg = false;
        if !self.check(&Token::RParen) {
            loop {
                if self.eat(&Token::Ellipsis) {
                    is_vararg = true;
                    break;
                }
                params.push(self.expect_name()?);
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
        }
        self.expect(&Token::RParen)?;

        self.functions.push(FnState { is_vararg, loops: 0 });
        let block = self.parse_block();
        self.functions.pop();
        let block = block?;
        self.expect(&Token::End)?;

        Ok(Rc::new(FuncBody { params, is_vararg, block, source: self.source.clone() }))
    }

    fn parse_namelist(&mut self) -> Result<Vec<String>> {
        let mut names = vec![self.expect_name()?];
        while self.eat(&Token::Comma) {
            names.push(self.expect_name()?);
        }
        Ok(names)
    }

    fn parse_exprlist(&mut self) -> Result<Vec<Expr>> {
        let mut exprs = vec![self.parse_expr()?];
        while self.eat(&Token::Comma) {
            exprs.push(self.parse_expr()?);
        }
        Ok(exprs)
    }

    // ---- Expressions ----

    pub fn parse_expr(&mut self) -> Result<Expr> {
        self.parse_subexpr(0)
    }

    /// Precedence climbing: consume operators whose left priority beats `limit`.
    fn parse_subexpr(&mut self, limit: u8) -> Result<Expr> {
        self.enter()?;
        let mut left = match self.peek().and_then(unary_op) {
            Some(op) => {
                self.advance();
                let operand = self.parse_subexpr(UNARY_PRIORITY)?;
                Expr::UnOp { op, operand: Box::new(operand) }
            }
            None => self.parse_simple()?,
        };
        // Each fold nests the tree one level deeper, so it counts like recursion.
        let mut levels = 1;
        while let Some(op) = self.peek().and_then(binary_op) {
            let (left_priority, right_priority) = op.priority();
            if left_priority <= limit {
                break;
            }
            self.advance();
            let right = self.parse_subexpr(right_priority)?;
            left = Expr::BinOp { op, left: Box::new(left), right: Box::new(right) };
            self.enter()?;
            levels += 1;
        }
        for _ in 0..levels {
            self.leave();
        }
        Ok(left)
    }

    fn parse_simple(&mut self) -> Result<Expr> {
        let expr = match self.peek().cloned() {
            Some(Token::Number(Numeral::Int(n))) => Expr::Integer(n),
            Some(Token::Number(Numeral::Float(f))) => Expr::Number(f),
            Some(Token::Str(s)) => Expr::String(s),
            Some(Token::Nil) => Expr::Nil,
            Some(Token::True) => Expr::True,
            Some(Token::False) => Expr::False,
            Some(Token::Ellipsis) => {
                if !self.in_vararg_function() {
                    return Err(self.error(
                        "MB-P006",
                        "cannot use '...' outside a vararg function".into(),
                    ));
                }
                self.advance();
                if self.eat(&Token::LBracket) {
                    let index = self.parse_expr()?;
                    self.expect(&Token::RBracket)?;
                    return Ok(Expr::VarargIndex(Box::new(index)));
                }
                return Ok(Expr::Vararg);
            }
            Some(Token::LBrace) => return self.parse_table(),
            Some(Token::Function) => {
                self.advance();
                return Ok(Expr::Function(self.parse_body(false)?));
            }
            _ => return self.parse_suffixed(),
        };
        self.advance();
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.peek().cloned() {
            Some(Token::Name(name)) => {
                self.advance();
                Ok(Expr::Name(name))
            }
            Some(Token::LParen) => {
                self.advance();
                let inner = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                Ok(Expr::Paren(Box::new(inner)))
            }
            Some(tok) => Err(self.error("MB-P004", format!("unexpected symbol {:?}", tok))),
            None => Err(self.error("MB-P002", "unexpected <eof>".into())),
        }
    }

    fn parse_suffixed(&mut self) -> Result<Expr> {
        let mut expr = self.parse_primary()?;
        let mut levels = 0;
        loop {
            let suffix = matches!(
                self.peek(),
                Some(Token::Dot | Token::LBracket | Token::Colon | Token::LParen | Token::Str(_) | Token::LBrace)
            );
            if suffix {
                self.enter()?;
                levels += 1;
            }
            match self.peek() {
                Some(Token::Dot) => {
                    self.advance();
                    let key = self.expect_name()?;
                    expr = Expr::Index { object: Box::new(expr), key: Box::new(Expr::String(key)) };
                }
                Some(Token::LBracket) => {
                    self.advance();
                    let key = self.parse_expr()?;
                    self.expect(&Token::RBracket)?;
                    expr = Expr::Index { object: Box::new(expr), key: Box::new(key) };
                }
                Some(Token::Colon) => {
                    self.advance();
                    let name = self.expect_name()?;
                    let args = self.parse_args()?;
                    expr = Expr::Method { object: Box::new(expr), name, args };
                }
                Some(Token::LParen | Token::Str(_) | Token::LBrace) => {
                    let args = self.parse_args()?;
                    expr = Expr::Call { function: Box::new(expr), args };
                }
                _ => break,
            }
        }
        for _ in 0..levels {
            self.leave();
        }
        Ok(expr)
    }

    fn parse_args(&mut self) -> Result<Vec<Expr>> {
        match self.peek().cloned() {
            Some(Token::Str(s)) => {
                self.advance();
                Ok(vec![Expr::String(s)])
            }
            Some(Token::LBrace) => Ok(vec![self.parse_table()?]),
            Some(Token::LParen) => {
                self.advance();
                if self.eat(&Token::RParen) {
                    return Ok(Vec::new());
                }
                let args = self.parse_exprlist()?;
                self.expect(&Token::RParen)?;
                Ok(args)
            }
            _ => Err(self.error("MB-P001", "function arguments expected".into())),
        }
    }

    fn parse_table(&mut self) -> Result<Expr> {
        self.expect(&Token::LBrace)?;
        let mut fields = Vec::new();
        while !self.check(&Token::RBrace) {
            if self.eat(&Token::LBracket) {
                let key = self.parse_expr()?;
                self.expect(&Token::RBracket)?;
                self.expect(&Token::Assign)?;
                let value = self.parse_expr()?;
                fields.push(Field::Keyed { key, value });
            } else if matches!(self.peek(), Some(Token::Name(_)))
                && matches!(self.token_at(self.pos + 1), Some(Token::Assign))
            {
                let name = self.expect_name()?;
                self.advance();
                let value = self.parse_expr()?;
                fields.push(Field::Keyed { key: Expr::String(name), value });
            } else {
                fields.push(Field::Positional(self.parse_expr()?));
            }
            if !self.eat(&Token::Comma) && !self.eat(&Token::Semicolon) {
                break;
            }
        }
        self.expect(&Token::RBrace)?;
        Ok(Expr::Table(fields))
    }
}

fn unary_op(tok: &Token) -> Option<UnOp> {
    match tok {
        Token::Minus => Some(UnOp::Neg),
        Token::Not => Some(UnOp::Not),
        Token::Hash => Some(UnOp::Len),
        _ => None,
    }
}

fn binary_op(tok: &Token) -> Option<BinOp> {
    Some(match tok {
        Token::Plus => BinOp::Add,
        Token::Minus => BinOp::Sub,
        Token::Star => BinOp::Mul,
        Token::Slash => BinOp::Div,
        Token::DoubleSlash => BinOp::FloorDiv,
        Token::Percent => BinOp::Mod,
        Token::Caret => BinOp::Pow,
        Token::Concat => BinOp::Concat,
        Token::Eq => BinOp::Eq,
        Token::NotEq => BinOp::Ne,
        Token::Less => BinOp::Lt,
        Token::LessEq => BinOp::Le,
        Token::Greater => BinOp::Gt,
        Token::GreaterEq => BinOp::Ge,
        Token::And => BinOp::And,
        Token::Or => BinOp::Or,
        _ => return None,
    })
}
