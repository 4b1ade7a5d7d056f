use crate::ast::*;
use crate::lexer::{Lexer, Token};
use cube_core::{CubeError, Result};

pub struct Parser {
    tokens: Vec<Token>,
    position: usize,
}

impl Parser {
    pub fn new(sql: &str) -> Result<Self> {
        let mut lexer = Lexer::new(sql);
        let tokens = lexer.tokenize()?;
        Ok(Self::from_tokens(tokens))
    }

    pub fn from_tokens(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            position: 0,
        }
    }

    /// Parse a single SELECT statement, allowing trailing semicolons
    pub fn parse(&mut self) -> Result<SelectStatement> {
        let statement = self.parse_select()?;

        while self.match_token(&Token::Semicolon) {}
        self.expect_token(&Token::Eof)?;

        Ok(statement)
    }

    /// Parse a standalone expression such as a measure or a filter clause
    pub fn parse_standalone_expr(&mut self) -> Result<Expr> {
        let expr = self.parse_expr()?;
        self.expect_token(&Token::Eof)?;
        Ok(expr)
    }

    fn parse_select(&mut self) -> Result<SelectStatement> {
        if self.current_token() == &Token::With {
            return Err(parse_error("WITH clauses are not supported"));
        }
        self.expect_token(&Token::Select)?;

        let distinct = self.match_token(&Token::Distinct);
        let projection = self.parse_projection()?;

        let from = if self.match_token(&Token::From) {
            Some(self.parse_table_reference()?)
        } else {
            None
        };

        if self.is_join_keyword() || self.current_token() == &Token::Comma {
            return Err(parse_error("Joins are not supported"));
        }

        let selection = if self.match_token(&Token::Where) {
            Some(self.parse_expr()?)
        } else {
            None
        };

        let group_by = if self.match_token(&Token::Group) {
            self.expect_token(&Token::By)?;
            self.parse_expr_list()?
        } else {
            vec![]
        };

        let having = if self.match_token(&Token::Having) {
            Some(self.parse_expr()?)
        } else {
            None
        };

        let order_by = if self.match_token(&Token::Order) {
            self.expect_token(&Token::By)?;
            self.parse_order_by()?
        } else {
            vec![]
        };

        let limit = if self.match_token(&Token::Limit) {
            Some(self.parse_number()?)
        } else {
            None
        };

        let offset = if self.match_token(&Token::Offset) {
            Some(self.parse_number()?)
        } else {
            None
        };

        if self.current_token() == &Token::Union {
            return Err(parse_error("Set operations are not supported"));
        }

        Ok(SelectStatement {
            distinct,
            projection,
            from,
            selection,
            group_by,
            having,
            order_by,
            limit,
            offset,
        })
    }

    fn is_join_keyword(&self) -> bool {
        matches!(
            self.current_token(),
            Token::Join | Token::Inner | Token::Left | Token::Right | Token::Full | Token::Cross
        )
    }

    fn parse_projection(&mut self) -> Result<Vec<SelectItem>> {
        let mut items = vec![];

        loop {
            if self.match_token(&Token::Star) {
                items.push(SelectItem::Wildcard);
            } else {
                let expr = self.parse_expr()?;

                if self.match_token(&Token::As) {
                    let alias = self.parse_identifier()?;
                    items.push(SelectItem::ExprWithAlias { expr, alias });
                } else if let Token::Identifier(id) = self.current_token() {
                    // Implicit alias without AS
                    let alias = id.clone();
                    self.advance();
                    items.push(SelectItem::ExprWithAlias { expr, alias });
                } else {
                    items.push(SelectItem::UnnamedExpr(expr));
                }
            }

            if !self.match_token(&Token::Comma) {
                break;
            }
        }

        Ok(items)
    }

    fn parse_table_reference(&mut self) -> Result<TableReference> {
        if self.current_token() == &Token::LeftParen {
            return Err(parse_error("Subqueries are not supported"));
        }

        let mut name = self.parse_identifier()?;
        while self.match_token(&Token::Dot) {
            name.push('.');
            name.push_str(&self.parse_identifier()?);
        }

        let alias = if self.match_token(&Token::As) {
            Some(self.parse_identifier()?)
        } else if let Token::Identifier(id) = self.current_token() {
            let alias = id.clone();
            self.advance();
            Some(alias)
        } else {
            None
        };

        Ok(TableReference { name, alias })
    }

    fn parse_expr(&mut self) -> Result<Expr> {
        self.parse_or_expr()
    }

    fn parse_or_expr(&mut self) -> Result<Expr> {
        let mut left = self.parse_and_expr()?;

        while self.match_token(&Token::Or) {
            let right = self.parse_and_expr()?;
            left = Expr::BinaryOp {
                left: Box::new(left),
                op: BinaryOperator::Or,
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    fn parse_and_expr(&mut self) -> Result<Expr> {
        let mut left = self.parse_not_expr()?;

        while self.match_token(&Token::And) {
            let right = self.parse_not_expr()?;
            left = Expr::BinaryOp {
                left: Box::new(left),
                op: BinaryOperator::And,
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    fn parse_not_expr(&mut self) -> Result<Expr> {
        if self.match_token(&Token::Not) {
            let expr = self.parse_not_expr()?;
            return Ok(Expr::UnaryOp {
                op: UnaryOperator::Not,
                expr: Box::new(expr),
            });
        }

        self.parse_comparison_expr()
    }

    fn parse_comparison_expr(&mut self) -> Result<Expr> {
        let left = self.parse_additive_expr()?;

        if let Some(op) = self.match_comparison_op() {
            let right = self.parse_additive_expr()?;
            return Ok(Expr::BinaryOp {
                left: Box::new(left),
                op,
                right: Box::new(right),
            });
        }

        if self.match_token(&Token::Is) {
            let negated = self.match_token(&Token::Not);
            self.expect_token(&Token::Null)?;
            return Ok(Expr::IsNull {
                expr: Box::new(left),
                negated,
            });
        }

        // NOT IN / NOT BETWEEN
        let negated = if self.current_token() == &Token::Not
            && matches!(self.peek_token(), Token::In | Token::Between)
        {
            self.advance();
            true
        } else {
            false
        };

        if self.match_token(&Token::In) {
            self.expect_token(&Token::LeftParen)?;
            if self.current_token() == &Token::Select {
                return Err(parse_error("Subqueries are not supported"));
            }
            let list = self.parse_expr_list()?;
            self.expect_token(&Token::RightParen)?;
            return Ok(Expr::InList {
                expr: Box::new(left),
                list,
                negated,
            });
        }

        if self.match_token(&Token::Between) {
            let low = self.parse_additive_expr()?;
            self.expect_token(&Token::And)?;
            let high = self.parse_additive_expr()?;
            return Ok(Expr::Between {
                expr: Box::new(left),
                low: Box::new(low),
                high: Box::new(high),
                negated,
            });
        }

        Ok(left)
    }

    fn parse_additive_expr(&mut self) -> Result<Expr> {
        let mut left = self.parse_multiplicative_expr()?;

        while let Some(op) = self.match_additive_op() {
            let right = self.parse_multiplicative_expr()?;
            left = Expr::BinaryOp {
                left: Box::new(left),
                op,
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    fn parse_multiplicative_expr(&mut self) -> Result<Expr> {
        let mut left = self.parse_unary_expr()?;

        while let Some(op) = self.match_multiplicative_op() {
            let right = self.parse_unary_expr()?;
            left = Expr::BinaryOp {
                left: Box::new(left),
                op,
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    fn parse_unary_expr(&mut self) -> Result<Expr> {
        if self.match_token(&Token::Minus) {
            // Fold the sign into numeric literals
            if let Token::Number(n) = self.current_token() {
                let num = format!("-{}", n);
                self.advance();
                return Ok(Expr::Literal(Literal::Number(num)));
            }
            let expr = self.parse_unary_expr()?;
            return Ok(Expr::UnaryOp {
                op: UnaryOperator::Minus,
                expr: Box::new(expr),
            });
        }

        if self.match_token(&Token::Plus) {
            return self.parse_unary_expr();
        }

        self.parse_primary_expr()
    }

    fn parse_primary_expr(&mut self) -> Result<Expr> {
        match self.current_token() {
            Token::Number(n) => {
                let num = n.clone();
                self.advance();
                Ok(Expr::Literal(Literal::Number(num)))
            }
            Token::String(s) => {
                let str = s.clone();
                self.advance();
                Ok(Expr::Literal(Literal::String(str)))
            }
            Token::True => {
                self.advance();
                Ok(Expr::Literal(Literal::Boolean(true)))
            }
            Token::False => {
                self.advance();
                Ok(Expr::Literal(Literal::Boolean(false)))
            }
            Token::Null => {
                self.advance();
                Ok(Expr::Literal(Literal::Null))
            }
            Token::Identifier(id) => {
                let name = id.clone();
                self.advance();

                if self.current_token() == &Token::LeftParen {
                    return self.parse_function_call(&name);
                }

                // Check for qualified column (table.column)
                if self.match_token(&Token::Dot) {
                    let column = self.parse_identifier()?;
                    Ok(Expr::QualifiedColumn {
                        table: name,
                        column,
                    })
                } else {
                    Ok(Expr::Column(name))
                }
            }
            Token::LeftParen => {
                self.advance();
                if self.current_token() == &Token::Select {
                    return Err(parse_error("Subqueries are not supported"));
                }
                let expr = self.parse_expr()?;
                self.expect_token(&Token::RightParen)?;
                Ok(expr)
            }
            _ => Err(parse_error(format!(
                "Unexpected token: {:?}",
                self.current_token()
            ))),
        }
    }

    fn parse_function_call(&mut self, name: &str) -> Result<Expr> {
        let func = AggregateFunction::from_name(name)
            .ok_or_else(|| parse_error(format!("Unsupported function: {}", name)))?;

        self.expect_token(&Token::LeftParen)?;
        let distinct = self.match_token(&Token::Distinct);

        let arg = if self.match_token(&Token::Star) {
            if func != AggregateFunction::Count || distinct {
                return Err(parse_error(format!("{}(*) is not supported", func)));
            }
            AggregateArg::Star
        } else {
            AggregateArg::Expr(Box::new(self.parse_expr()?))
        };
        self.expect_token(&Token::RightParen)?;

        Ok(Expr::AggregateFunction {
            func,
            arg,
            distinct,
        })
    }

    fn parse_expr_list(&mut self) -> Result<Vec<Expr>> {
        let mut exprs = vec![];

        loop {
            exprs.push(self.parse_expr()?);

            if !self.match_token(&Token::Comma) {
                break;
            }
        }

        Ok(exprs)
    }

    fn parse_order_by(&mut self) -> Result<Vec<OrderByExpr>> {
        let mut order_by = vec![];

        loop {
            let expr = self.parse_expr()?;
            let asc = if self.match_token(&Token::Desc) {
                false
            } else {
                self.match_token(&Token::Asc);
                true
            };

            order_by.push(OrderByExpr { expr, asc });

            if !self.match_token(&Token::Comma) {
                break;
            }
        }

        Ok(order_by)
    }

    fn parse_identifier(&mut self) -> Result<String> {
        match self.current_token() {
            Token::Identifier(id) => {
                let name = id.clone();
                self.advance();
                Ok(name)
            }
            other => Err(parse_error(format!(
                "Expected identifier, found {:?}",
                other
            ))),
        }
    }

    fn parse_number(&mut self) -> Result<usize> {
        match self.current_token() {
            Token::Number(n) => {
                let num = n
                    .parse()
                    .map_err(|_| parse_error(format!("Invalid number: {}", n)))?;
                self.advance();
                Ok(num)
            }
            _ => Err(parse_error("Expected number")),
        }
    }

    fn match_comparison_op(&mut self) -> Option<BinaryOperator> {
        let op = match self.current_token() {
            Token::Equal => Some(BinaryOperator::Equal),
            Token::NotEqual => Some(BinaryOperator::NotEqual),
            Token::Less => Some(BinaryOperator::Less),
            Token::LessEqual => Some(BinaryOperator::LessEqual),
            Token::Greater => Some(BinaryOperator::Greater),
            Token::GreaterEqual => Some(BinaryOperator::GreaterEqual),
            _ => None,
        };

        if op.is_some() {
            self.advance();
        }

        op
    }

    fn match_additive_op(&mut self) -> Option<BinaryOperator> {
        let op = match self.current_token() {
            Token::Plus => Some(BinaryOperator::Plus),
            Token::Minus => Some(BinaryOperator::Minus),
            _ => None,
        };

        if op.is_some() {
            self.advance();
        }

        op
    }

    fn match_multiplicative_op(&mut self) -> Option<BinaryOperator> {
        let op = match self.current_token() {
            Token::Star => Some(BinaryOperator::Multiply),
            Token::Slash => Some(BinaryOperator::Divide),
            Token::Percent => Some(BinaryOperator::Modulo),
            _ => None,
        };

        if op.is_some() {
            self.advance();
        }

        op
    }

    fn current_token(&self) -> &Token {
        &self.tokens[self.position]
    }

    fn peek_token(&self) -> &Token {
        let next = (self.position + 1).min(self.tokens.len() - 1);
        &self.tokens[next]
    }

    fn advance(&mut self) {
        if self.position < self.tokens.len() - 1 {
            self.position += 1;
        }
    }

    fn match_token(&mut self, token: &Token) -> bool {
        if self.current_token() == token {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_token(&mut self, token: &Token) -> Result<()> {
        if self.current_token() == token {
            self.advance();
            Ok(())
        } else {
            Err(parse_error(format!(
                "Expected {:?}, found {:?}",
                token,
                self.current_token()
            )))
        }
    }
}

/// Parse a standalone expression such as `SUM(count)` or `p1 = 'a' AND p2 > 3`
pub fn parse_expression(text: &str) -> Result<Expr> {
    Parser::new(text)?.parse_standalone_expr()
}

fn parse_error(msg: impl Into<String>) -> CubeError {
    CubeError::RejectedQuery(msg.into())
}
