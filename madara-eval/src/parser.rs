// Precedence-climbing parser over the token stream from `token.rs` (spec
// §4.2): a single loop threads an accumulated minimum precedence through
// parenthesized groups rather than recursing once per grammar level.

use madara_lang::RecordValue;

use crate::ast::{BinaryOp, ExprTree, SeqKind, UnaryOp};
use crate::error::{KarlError, Result};
use crate::token::{tokenize, Spanned, Token};

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
}

/// `(op, left-binding precedence, right-associative)`. Ascending precedence
/// per spec §4.2; `;` binds loosest, system calls/literals bind tightest
/// and never appear in this table (they are handled by `parse_primary`).
fn binary_op(tok: &Token) -> Option<(BinaryOp, u8, bool)> {
    match tok {
        Token::Op("=>") => Some((BinaryOp::Implies, 3, true)),
        Token::Op("=") => Some((BinaryOp::Assign, 4, true)),
        Token::Op("||") => Some((BinaryOp::Or, 5, false)),
        Token::Op("&&") => Some((BinaryOp::And, 6, false)),
        Token::Op("==") => Some((BinaryOp::Eq, 7, false)),
        Token::Op("!=") => Some((BinaryOp::Ne, 7, false)),
        Token::Op("<") => Some((BinaryOp::Lt, 8, false)),
        Token::Op("<=") => Some((BinaryOp::Le, 8, false)),
        Token::Op(">") => Some((BinaryOp::Gt, 8, false)),
        Token::Op(">=") => Some((BinaryOp::Ge, 8, false)),
        Token::Op("+") => Some((BinaryOp::Add, 9, false)),
        Token::Op("-") => Some((BinaryOp::Sub, 9, false)),
        Token::Op("*") => Some((BinaryOp::Mul, 10, false)),
        Token::Op("/") => Some((BinaryOp::Div, 10, false)),
        Token::Op("%") => Some((BinaryOp::Mod, 10, false)),
        _ => None,
    }
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos].token
    }

    fn offset(&self) -> usize {
        self.tokens[self.pos].offset
    }

    fn advance(&mut self) -> Token {
        let t = self.tokens[self.pos].token.clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, tok: &Token, expected: &'static str) -> Result<()> {
        if self.peek() == tok {
            self.advance();
            Ok(())
        } else {
            Err(KarlError::UnexpectedToken {
                found: format!("{:?}", self.peek()),
                expected,
                offset: self.offset(),
            })
        }
    }

    /// Top level: `;` / `;>` sequence, lowest precedence, handled outside
    /// the climbing loop since both are variadic n-ary nodes rather than
    /// simple left/right binary ones.
    fn parse_sequence(&mut self) -> Result<ExprTree> {
        let mut items = vec![self.parse_binary(3)?];
        let mut kind = SeqKind::Both;
        loop {
            match self.peek() {
                Token::Op(";") => {
                    self.advance();
                    items.push(self.parse_binary(3)?);
                }
                Token::Op(";>") => {
                    kind = SeqKind::ReturnRight;
                    self.advance();
                    items.push(self.parse_binary(3)?);
                }
                _ => break,
            }
        }
        Ok(if items.len() == 1 {
            items.pop().unwrap()
        } else {
            ExprTree::Sequence { kind, items }
        })
    }

    fn parse_binary(&mut self, min_prec: u8) -> Result<ExprTree> {
        let mut lhs = self.parse_unary()?;
        loop {
            let Some((op, prec, right_assoc)) = binary_op(self.peek()) else {
                break;
            };
            if prec < min_prec {
                break;
            }
            self.advance();
            let next_min = if right_assoc { prec } else { prec + 1 };
            let rhs = self.parse_binary(next_min)?;
            lhs = ExprTree::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) };
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<ExprTree> {
        match self.peek() {
            Token::Op("!") => {
                self.advance();
                Ok(ExprTree::Unary { op: UnaryOp::Not, operand: Box::new(self.parse_unary()?) })
            }
            Token::Op("-") => {
                self.advance();
                Ok(ExprTree::Unary { op: UnaryOp::Negate, operand: Box::new(self.parse_unary()?) })
            }
            Token::Op("++") => {
                self.advance();
                Ok(ExprTree::Unary { op: UnaryOp::PreInc, operand: Box::new(self.parse_unary()?) })
            }
            Token::Op("--") => {
                self.advance();
                Ok(ExprTree::Unary { op: UnaryOp::PreDec, operand: Box::new(self.parse_unary()?) })
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> Result<ExprTree> {
        let mut node = self.parse_primary()?;
        loop {
            match self.peek() {
                Token::LBracket => {
                    self.advance();
                    let index = self.parse_binary(3)?;
                    self.expect(&Token::RBracket, "]")?;
                    node = ExprTree::ArrayReference { var: Box::new(node), index: Box::new(index) };
                }
                Token::Op("++") => {
                    self.advance();
                    node = ExprTree::Unary { op: UnaryOp::PostInc, operand: Box::new(node) };
                }
                Token::Op("--") => {
                    self.advance();
                    node = ExprTree::Unary { op: UnaryOp::PostDec, operand: Box::new(node) };
                }
                _ => break,
            }
        }
        Ok(node)
    }

    fn parse_primary(&mut self) -> Result<ExprTree> {
        match self.peek().clone() {
            Token::Integer(i) => {
                self.advance();
                Ok(ExprTree::Leaf(RecordValue::Integer(i)))
            }
            Token::Double(d) => {
                self.advance();
                Ok(ExprTree::Leaf(RecordValue::from(d)))
            }
            Token::String(s) => {
                self.advance();
                Ok(ExprTree::Leaf(RecordValue::from(s)))
            }
            Token::Identifier(name) => {
                self.advance();
                if self.peek() == &Token::LParen {
                    let args = self.parse_arg_list()?;
                    Ok(ExprTree::Call { name, args })
                } else {
                    Ok(ExprTree::Variable { key: name })
                }
            }
            Token::SystemCall(name) => {
                self.advance();
                let args = self.parse_arg_list()?;
                Ok(ExprTree::SystemCall { name, args })
            }
            Token::LParen => {
                self.advance();
                let inner = self.parse_sequence()?;
                self.expect(&Token::RParen, ")")?;
                Ok(inner)
            }
            Token::LBracket => {
                self.advance();
                let mut items = Vec::new();
                if self.peek() != &Token::RBracket {
                    items.push(self.parse_binary(3)?);
                    while self.peek() == &Token::Comma {
                        self.advance();
                        items.push(self.parse_binary(3)?);
                    }
                }
                self.expect(&Token::RBracket, "]")?;
                Ok(ExprTree::ConstArray(items))
            }
            other => Err(KarlError::UnexpectedToken {
                found: format!("{other:?}"),
                expected: "an expression",
                offset: self.offset(),
            }),
        }
    }

    fn parse_arg_list(&mut self) -> Result<Vec<ExprTree>> {
        self.expect(&Token::LParen, "(")?;
        let mut args = Vec::new();
        if self.peek() != &Token::RParen {
            args.push(self.parse_binary(3)?);
            while self.peek() == &Token::Comma {
                self.advance();
                args.push(self.parse_binary(3)?);
            }
        }
        self.expect(&Token::RParen, ")")?;
        Ok(args)
    }
}

/// Tokenizes and parses `source` into an unpruned `ExprTree` rooted at a
/// single top-level sequence node (spec §4.2's "ComponentNode").
pub fn parse(source: &str) -> Result<ExprTree> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let tree = parser.parse_sequence()?;
    if parser.peek() != &Token::Eof {
        return Err(KarlError::UnexpectedToken {
            found: format!("{:?}", parser.peek()),
            expected: "end of input",
            offset: parser.offset(),
        });
    }
    Ok(tree)
}

#[cfg(test)]
mod test {
    use super::*;
    use madara_context::{Context, UpdateSettings};

    #[test]
    fn precedence_multiplication_binds_tighter_than_addition() {
        let tree = parse("1 + 2 * 3").unwrap();
        let (pruned, can_change) = tree.prune().unwrap();
        assert!(!can_change);
        assert!(matches!(pruned, ExprTree::Leaf(RecordValue::Integer(7))));
    }

    #[test]
    fn assignment_is_right_associative_and_implies_binds_looser() {
        let context = Context::new("self", 1);
        let settings = UpdateSettings::new();
        let (tree, _) = parse(".a => (.b = 5)").unwrap().prune().unwrap();
        context.set(".a", 1i64, &settings);
        let result = tree.evaluate(&context, &settings).unwrap();
        assert_eq!(result.value, RecordValue::Integer(1));
        assert_eq!(context.get(".b").value, RecordValue::Integer(5));
    }

    #[test]
    fn s4_and_short_circuits_leaving_assignment_unevaluated() {
        let context = Context::new("self", 1);
        let settings = UpdateSettings::new();
        context.set(".a", 0i64, &settings);
        context.set(".b", 1i64, &settings);
        let (tree, _) = parse(".a && (.b = 0 ; .b)").unwrap().prune().unwrap();
        let result = tree.evaluate(&context, &settings).unwrap();
        assert_eq!(result.value, RecordValue::Integer(0));
        assert_eq!(context.get(".b").value, RecordValue::Integer(1));
    }

    #[test]
    fn sequence_and_return_right_parse_distinctly() {
        let (both, _) = parse("1 ; 9 ; 3").unwrap().prune().unwrap();
        assert!(matches!(both, ExprTree::Leaf(RecordValue::Integer(9))));
        let (right, _) = parse("1 ;> 9 ;> 3").unwrap().prune().unwrap();
        assert!(matches!(right, ExprTree::Leaf(RecordValue::Integer(3))));
    }

    #[test]
    fn array_literal_and_indexing_round_trip() {
        let context = Context::new("self", 1);
        let settings = UpdateSettings::new();
        let (assign, _) = parse("arr = [1, 2, 3]").unwrap().prune().unwrap();
        assign.evaluate(&context, &settings).unwrap();
        let (index, _) = parse("arr[1]").unwrap().prune().unwrap();
        let result = index.evaluate(&context, &settings).unwrap();
        assert_eq!(result.value, RecordValue::Integer(2));
    }

    #[test]
    fn registered_function_call_dispatches_through_the_registry() {
        let context = Context::new("self", 1);
        let settings = UpdateSettings::new();
        context.register_native("double_it", |_ctx, args| {
            Ok(madara_lang::Record::new(RecordValue::Integer(args[0].value.as_integer() * 2)))
        });
        let (tree, _) = parse("double_it(21)").unwrap().prune().unwrap();
        let result = tree.evaluate(&context, &settings).unwrap();
        assert_eq!(result.value, RecordValue::Integer(42));
    }

    #[test]
    fn system_call_parses_with_argument_list() {
        let tree = parse("#sqrt(9)").unwrap();
        match tree {
            ExprTree::SystemCall { name, args } => {
                assert_eq!(name, "sqrt");
                assert_eq!(args.len(), 1);
            }
            other => panic!("expected SystemCall, got {other:?}"),
        }
    }
}
