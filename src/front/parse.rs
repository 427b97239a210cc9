//! The parser

use std::fmt::Debug;

use derive_more::derive::Display;

use crate::common::*;

use super::ast::*;
use super::lex::*;

#[derive(Display)]
#[display("Parse error: {}", self.0)]
pub struct ParseError(String);

impl Debug for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

pub fn parse(input: &str) -> Result<Program, ParseError> {
    let tokens = tokenize(input).map_err(|e| ParseError(e.to_string()))?;
    Parser { tokens, pos: 0 }.program()
}

struct Parser<'src> {
    tokens: Vec<Token<'src>>,
    pos: usize,
}

impl<'src> Parser<'src> {
    fn peek(&self) -> Option<&Token<'src>> {
        self.tokens.get(self.pos)
    }

    fn kind(&self) -> Option<TokenKind> {
        self.peek().map(|t| t.kind)
    }

    fn kind_at(&self, lookahead: usize) -> Option<TokenKind> {
        self.tokens.get(self.pos + lookahead).map(|t| t.kind)
    }

    fn at(&self, kind: TokenKind) -> bool {
        self.kind() == Some(kind)
    }

    fn bump(&mut self) -> Token<'src> {
        let token = self.tokens[self.pos];
        self.pos += 1;
        token
    }

    /// Advance past `kind` if it is next.
    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.at(kind) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Result<Token<'src>, ParseError> {
        if self.at(kind) {
            Ok(self.bump())
        } else {
            self.unexpected(&format!("'{kind}'"))
        }
    }

    fn unexpected<T>(&self, what: &str) -> Result<T, ParseError> {
        match self.peek() {
            Some(token) => Err(ParseError(format!("expected {what}, found {token}"))),
            None => Err(ParseError(format!("expected {what}, found end of input"))),
        }
    }

    fn program(mut self) -> Result<Program, ParseError> {
        let mut items = Vec::new();
        while self.peek().is_some() {
            items.push(self.item()?);
        }
        Ok(Program { items })
    }

    fn item(&mut self) -> Result<Item, ParseError> {
        match self.kind() {
            Some(TokenKind::Void) => {
                self.bump();
                Ok(Item::Func(self.func_def(RetType::Void)?))
            }
            Some(TokenKind::Int) | Some(TokenKind::Float) => {
                // `int f(` opens a function, anything else is a variable
                if self.kind_at(2) == Some(TokenKind::LParen) {
                    let ret = if self.bump().kind == TokenKind::Int {
                        RetType::Int
                    } else {
                        RetType::Float
                    };
                    Ok(Item::Func(self.func_def(ret)?))
                } else {
                    Ok(Item::Global(self.var_decl()?))
                }
            }
            _ => self.unexpected("a declaration"),
        }
    }

    fn btype(&mut self) -> Result<BType, ParseError> {
        match self.kind() {
            Some(TokenKind::Int) => {
                self.bump();
                Ok(BType::Int)
            }
            Some(TokenKind::Float) => {
                self.bump();
                Ok(BType::Float)
            }
            _ => self.unexpected("a type"),
        }
    }

    fn func_def(&mut self, ret: RetType) -> Result<FuncDef, ParseError> {
        let name = intern(self.expect(TokenKind::Id)?.text);
        self.expect(TokenKind::LParen)?;
        let mut params = Vec::new();
        if !self.at(TokenKind::RParen) {
            loop {
                params.push(self.param()?);
                if !self.eat(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen)?;
        let body = self.block()?;
        Ok(FuncDef {
            ret,
            name,
            params,
            body,
        })
    }

    fn param(&mut self) -> Result<Param, ParseError> {
        let ty = self.btype()?;
        let name = intern(self.expect(TokenKind::Id)?.text);
        let array = if self.eat(TokenKind::LBracket) {
            self.expect(TokenKind::RBracket)?;
            true
        } else {
            false
        };
        Ok(Param { ty, name, array })
    }

    fn var_decl(&mut self) -> Result<Vec<VarDecl>, ParseError> {
        let ty = self.btype()?;
        let mut decls = Vec::new();
        loop {
            let name = intern(self.expect(TokenKind::Id)?.text);
            let dim = if self.eat(TokenKind::LBracket) {
                let len = self.expr()?;
                self.expect(TokenKind::RBracket)?;
                Some(len)
            } else {
                None
            };
            let init = if self.eat(TokenKind::Assign) {
                Some(self.init_val()?)
            } else {
                None
            };
            decls.push(VarDecl {
                ty,
                name,
                dim,
                init,
            });
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::Semi)?;
        Ok(decls)
    }

    fn init_val(&mut self) -> Result<InitVal, ParseError> {
        if self.eat(TokenKind::LBrace) {
            let mut elements = Vec::new();
            if !self.at(TokenKind::RBrace) {
                loop {
                    elements.push(self.expr()?);
                    if !self.eat(TokenKind::Comma) {
                        break;
                    }
                }
            }
            self.expect(TokenKind::RBrace)?;
            Ok(InitVal::List(elements))
        } else {
            Ok(InitVal::Expr(self.expr()?))
        }
    }

    fn block(&mut self) -> Result<Block, ParseError> {
        self.expect(TokenKind::LBrace)?;
        let mut stmts = Vec::new();
        while !self.at(TokenKind::RBrace) {
            if self.peek().is_none() {
                return self.unexpected("'}'");
            }
            stmts.push(self.stmt()?);
        }
        self.expect(TokenKind::RBrace)?;
        Ok(Block { stmts })
    }

    fn stmt(&mut self) -> Result<Stmt, ParseError> {
        match self.kind() {
            Some(TokenKind::Int) | Some(TokenKind::Float) => Ok(Stmt::Decl(self.var_decl()?)),
            Some(TokenKind::LBrace) => Ok(Stmt::Block(self.block()?)),
            Some(TokenKind::If) => {
                self.bump();
                self.expect(TokenKind::LParen)?;
                let guard = self.expr()?;
                self.expect(TokenKind::RParen)?;
                let tt = Box::new(self.stmt()?);
                let ff = if self.eat(TokenKind::Else) {
                    Some(Box::new(self.stmt()?))
                } else {
                    None
                };
                Ok(Stmt::If { guard, tt, ff })
            }
            Some(TokenKind::While) => {
                self.bump();
                self.expect(TokenKind::LParen)?;
                let guard = self.expr()?;
                self.expect(TokenKind::RParen)?;
                let body = Box::new(self.stmt()?);
                Ok(Stmt::While { guard, body })
            }
            Some(TokenKind::Break) => {
                self.bump();
                self.expect(TokenKind::Semi)?;
                Ok(Stmt::Break)
            }
            Some(TokenKind::Continue) => {
                self.bump();
                self.expect(TokenKind::Semi)?;
                Ok(Stmt::Continue)
            }
            Some(TokenKind::Return) => {
                self.bump();
                let value = if self.at(TokenKind::Semi) {
                    None
                } else {
                    Some(self.expr()?)
                };
                self.expect(TokenKind::Semi)?;
                Ok(Stmt::Return(value))
            }
            Some(TokenKind::Semi) => {
                self.bump();
                Ok(Stmt::Expr(None))
            }
            _ => {
                let expr = self.expr()?;
                if self.eat(TokenKind::Assign) {
                    let target = match expr {
                        Expr::LVal(lval) => lval,
                        _ => return self.unexpected("an assignable name"),
                    };
                    let value = self.expr()?;
                    self.expect(TokenKind::Semi)?;
                    Ok(Stmt::Assign { target, value })
                } else {
                    self.expect(TokenKind::Semi)?;
                    Ok(Stmt::Expr(Some(expr)))
                }
            }
        }
    }

    fn expr(&mut self) -> Result<Expr, ParseError> {
        self.lor()
    }

    fn binary_chain(
        &mut self,
        next: fn(&mut Self) -> Result<Expr, ParseError>,
        table: &[(TokenKind, BOp)],
    ) -> Result<Expr, ParseError> {
        let mut lhs = next(self)?;
        'outer: loop {
            for &(kind, op) in table {
                if self.eat(kind) {
                    let rhs = next(self)?;
                    lhs = Expr::BOp {
                        op,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    };
                    continue 'outer;
                }
            }
            return Ok(lhs);
        }
    }

    fn lor(&mut self) -> Result<Expr, ParseError> {
        self.binary_chain(Self::land, &[(TokenKind::OrOr, BOp::Or)])
    }

    fn land(&mut self) -> Result<Expr, ParseError> {
        self.binary_chain(Self::equality, &[(TokenKind::AndAnd, BOp::And)])
    }

    fn equality(&mut self) -> Result<Expr, ParseError> {
        self.binary_chain(
            Self::relational,
            &[(TokenKind::EqEq, BOp::Eq), (TokenKind::Ne, BOp::Ne)],
        )
    }

    fn relational(&mut self) -> Result<Expr, ParseError> {
        self.binary_chain(
            Self::additive,
            &[
                (TokenKind::Lt, BOp::Lt),
                (TokenKind::Le, BOp::Le),
                (TokenKind::Gt, BOp::Gt),
                (TokenKind::Ge, BOp::Ge),
            ],
        )
    }

    fn additive(&mut self) -> Result<Expr, ParseError> {
        self.binary_chain(
            Self::multiplicative,
            &[(TokenKind::Plus, BOp::Add), (TokenKind::Minus, BOp::Sub)],
        )
    }

    fn multiplicative(&mut self) -> Result<Expr, ParseError> {
        self.binary_chain(
            Self::unary,
            &[
                (TokenKind::Star, BOp::Mul),
                (TokenKind::Slash, BOp::Div),
                (TokenKind::Percent, BOp::Mod),
            ],
        )
    }

    fn unary(&mut self) -> Result<Expr, ParseError> {
        let op = match self.kind() {
            Some(TokenKind::Plus) => UOp::Pos,
            Some(TokenKind::Minus) => UOp::Neg,
            Some(TokenKind::Not) => UOp::Not,
            _ => return self.primary(),
        };
        self.bump();
        Ok(Expr::Unary {
            op,
            operand: Box::new(self.unary()?),
        })
    }

    fn primary(&mut self) -> Result<Expr, ParseError> {
        match self.kind() {
            Some(TokenKind::LParen) => {
                self.bump();
                let expr = self.expr()?;
                self.expect(TokenKind::RParen)?;
                Ok(expr)
            }
            Some(TokenKind::IntNum) => {
                let text = self.bump().text;
                let value = if let Some(hex) = text.strip_prefix("0x").or(text.strip_prefix("0X")) {
                    u32::from_str_radix(hex, 16)
                        .map_err(|_| ParseError(format!("integer literal '{text}' out of range")))?
                        as i32
                } else {
                    text.parse::<i64>()
                        .ok()
                        .filter(|v| (0..=u32::MAX as i64).contains(v))
                        .ok_or_else(|| {
                            ParseError(format!("integer literal '{text}' out of range"))
                        })? as i32
                };
                Ok(Expr::Int(value))
            }
            Some(TokenKind::FloatNum) => {
                let text = self.bump().text;
                Ok(Expr::Float(text.parse().unwrap()))
            }
            Some(TokenKind::Id) => {
                let name = intern(self.bump().text);
                if self.eat(TokenKind::LParen) {
                    let mut args = Vec::new();
                    if !self.at(TokenKind::RParen) {
                        loop {
                            args.push(self.expr()?);
                            if !self.eat(TokenKind::Comma) {
                                break;
                            }
                        }
                    }
                    self.expect(TokenKind::RParen)?;
                    Ok(Expr::Call { callee: name, args })
                } else if self.eat(TokenKind::LBracket) {
                    let index = self.expr()?;
                    self.expect(TokenKind::RBracket)?;
                    Ok(Expr::LVal(LVal {
                        name,
                        index: Some(Box::new(index)),
                    }))
                } else {
                    Ok(Expr::LVal(LVal { name, index: None }))
                }
            }
            _ => self.unexpected("an expression"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_function() {
        let program = parse("int main() { return 0; }").unwrap();
        assert_eq!(program.items.len(), 1);
        match &program.items[0] {
            Item::Func(f) => {
                assert_eq!(f.name.as_str(), "main");
                assert_eq!(f.body.stmts.len(), 1);
            }
            other => panic!("expected a function, got {other:?}"),
        }
    }

    #[test]
    fn distinguishes_globals_from_functions() {
        let program = parse("int x = 3; int f(int y) { return y; }").unwrap();
        assert!(matches!(program.items[0], Item::Global(_)));
        assert!(matches!(program.items[1], Item::Func(_)));
    }

    #[test]
    fn precedence_builds_leftward() {
        let program = parse("int main() { return 1 + 2 * 3 < 4; }").unwrap();
        let Item::Func(f) = &program.items[0] else {
            panic!()
        };
        let Stmt::Return(Some(Expr::BOp { op, lhs, .. })) = &f.body.stmts[0] else {
            panic!("expected a return of a comparison")
        };
        assert_eq!(*op, BOp::Lt);
        let Expr::BOp { op: add, rhs, .. } = lhs.as_ref() else {
            panic!("expected an addition under the comparison")
        };
        assert_eq!(*add, BOp::Add);
        assert!(matches!(rhs.as_ref(), Expr::BOp { op: BOp::Mul, .. }));
    }

    #[test]
    fn rejects_bad_assignment_targets() {
        assert!(parse("int main() { 1 = 2; }").is_err());
    }

    #[test]
    fn array_declarations_and_indexing() {
        let src = "int main() { int a[10]; a[3] = 7; return a[3]; }";
        assert!(parse(src).is_ok());
    }
}
