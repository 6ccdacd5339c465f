// Copyright (c) 2023 - 2025 Tessera Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Column-visibility expressions: boolean combinations of authorization
//! tokens, e.g. `admin&(audit|ops)`. An empty expression is visible to
//! everyone.

use std::collections::HashSet;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid visibility expression at byte {position}")]
pub struct InvalidVisibility {
    pub position: usize,
}

/// Evaluates visibility expressions against a fixed set of authorizations.
pub struct VisibilityEvaluator {
    auths: HashSet<Vec<u8>>,
}

impl VisibilityEvaluator {
    pub fn new(auths: impl IntoIterator<Item = impl Into<Vec<u8>>>) -> Self {
        VisibilityEvaluator {
            auths: auths.into_iter().map(Into::into).collect(),
        }
    }

    /// True if the holder of these authorizations may read data labeled
    /// with `expression`.
    pub fn can_access(&self, expression: &[u8]) -> Result<bool, InvalidVisibility> {
        if expression.is_empty() {
            return Ok(true);
        }
        let mut parser = Parser {
            input: expression,
            position: 0,
            auths: &self.auths,
        };
        let result = parser.or_expression()?;
        if parser.position != parser.input.len() {
            return Err(InvalidVisibility {
                position: parser.position,
            });
        }
        Ok(result)
    }
}

struct Parser<'a> {
    input: &'a [u8],
    position: usize,
    auths: &'a HashSet<Vec<u8>>,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<u8> {
        self.input.get(self.position).copied()
    }

    fn or_expression(&mut self) -> Result<bool, InvalidVisibility> {
        let mut result = self.and_expression()?;
        while self.peek() == Some(b'|') {
            self.position += 1;
            result |= self.and_expression()?;
        }
        Ok(result)
    }

    fn and_expression(&mut self) -> Result<bool, InvalidVisibility> {
        let mut result = self.term()?;
        while self.peek() == Some(b'&') {
            self.position += 1;
            result &= self.term()?;
        }
        Ok(result)
    }

    fn term(&mut self) -> Result<bool, InvalidVisibility> {
        match self.peek() {
            Some(b'(') => {
                self.position += 1;
                let inner = self.or_expression()?;
                if self.peek() != Some(b')') {
                    return Err(InvalidVisibility {
                        position: self.position,
                    });
                }
                self.position += 1;
                Ok(inner)
            }
            Some(c) if is_token_byte(c) => {
                let start = self.position;
                while self.peek().is_some_and(is_token_byte) {
                    self.position += 1;
                }
                Ok(self.auths.contains(&self.input[start..self.position]))
            }
            _ => Err(InvalidVisibility {
                position: self.position,
            }),
        }
    }
}

fn is_token_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'_' | b'-' | b'.' | b':' | b'/')
}
