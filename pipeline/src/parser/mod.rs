//! Parser for the semicolon-separated operation language.
//!
//! Produces one [`Operation`] per clause, in source order. Only syntax is
//! validated here; semantic checks (variable existence, dimension
//! compatibility) are deferred to execution. Function names accept both
//! hyphenated and underscored spellings.

mod lexer;

pub use lexer::{SpannedToken, Token, tokenize};

use std::str::FromStr;

use tropo_product::{DataType, DimensionType};

use crate::collocation::CollocationSide;
use crate::error::{PipelineError, Result};
use crate::operation::{AreaSpec, Operation};
use crate::predicate::{BitMaskOp, ComparisonOp, MembershipOp};

/// Parse an operation string into its list of operations.
pub fn parse_operations(source: &str) -> Result<Vec<Operation>> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, cursor: 0, source_len: source.len() };
    let mut operations = Vec::new();

    while !parser.at_end() {
        operations.push(parser.parse_clause()?);
        if !parser.at_end() {
            parser.expect(&Token::Semicolon)?;
        }
    }
    Ok(operations)
}

struct Parser {
    tokens: Vec<SpannedToken>,
    cursor: usize,
    source_len: usize,
}

impl Parser {
    fn at_end(&self) -> bool {
        self.cursor >= self.tokens.len()
    }

    fn position(&self) -> usize {
        self.tokens
            .get(self.cursor)
            .map(|t| t.position)
            .unwrap_or(self.source_len)
    }

    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.cursor).map(|t| t.token.clone())
    }

    fn peek_at(&self, offset: usize) -> Option<Token> {
        self.tokens.get(self.cursor + offset).map(|t| t.token.clone())
    }

    fn next(&mut self) -> Result<Token> {
        let token = self
            .tokens
            .get(self.cursor)
            .map(|t| t.token.clone())
            .ok_or_else(|| PipelineError::script(self.source_len, "unexpected end of input"))?;
        self.cursor += 1;
        Ok(token)
    }

    fn error(&self, message: impl Into<String>) -> PipelineError {
        PipelineError::script(self.position(), message)
    }

    fn expect(&mut self, expected: &Token) -> Result<()> {
        let position = self.position();
        let token = self.next()?;
        if &token != expected {
            return Err(PipelineError::script(
                position,
                format!("expected {expected:?}, found {token:?}"),
            ));
        }
        Ok(())
    }

    fn expect_ident(&mut self) -> Result<String> {
        let position = self.position();
        match self.next()? {
            Token::Ident(name) => Ok(name),
            token => Err(PipelineError::script(
                position,
                format!("expected an identifier, found {token:?}"),
            )),
        }
    }

    fn expect_string(&mut self) -> Result<String> {
        let position = self.position();
        match self.next()? {
            Token::Str(value) => Ok(value),
            token => Err(PipelineError::script(
                position,
                format!("expected a string, found {token:?}"),
            )),
        }
    }

    /// Identifier or quoted string, for names that may need quoting.
    fn expect_name(&mut self) -> Result<String> {
        let position = self.position();
        match self.next()? {
            Token::Ident(name) => Ok(name),
            Token::Str(value) => Ok(value),
            token => Err(PipelineError::script(
                position,
                format!("expected a name, found {token:?}"),
            )),
        }
    }

    fn expect_number(&mut self) -> Result<f64> {
        let position = self.position();
        match self.next()? {
            Token::Int(value) => Ok(value as f64),
            Token::Float(value) => Ok(value),
            token => Err(PipelineError::script(
                position,
                format!("expected a number, found {token:?}"),
            )),
        }
    }

    fn expect_int(&mut self) -> Result<i64> {
        let position = self.position();
        match self.next()? {
            Token::Int(value) => Ok(value),
            token => Err(PipelineError::script(
                position,
                format!("expected an integer, found {token:?}"),
            )),
        }
    }

    fn expect_dimension(&mut self) -> Result<DimensionType> {
        let position = self.position();
        let name = self.expect_ident()?;
        DimensionType::from_str(&name)
            .map_err(|_| PipelineError::script(position, format!("unknown dimension '{name}'")))
    }

    fn expect_side(&mut self) -> Result<CollocationSide> {
        let position = self.position();
        match self.next()? {
            Token::Ident(s) if s == "a" => Ok(CollocationSide::A),
            Token::Ident(s) if s == "b" => Ok(CollocationSide::B),
            token => Err(PipelineError::script(
                position,
                format!("expected dataset side 'a' or 'b', found {token:?}"),
            )),
        }
    }

    fn maybe_unit(&mut self) -> Option<String> {
        if let Some(Token::Unit(_)) = self.peek() {
            if let Ok(Token::Unit(unit)) = self.next() {
                return Some(unit);
            }
        }
        None
    }

    /// Parenthesized comma-separated number list.
    fn number_list(&mut self) -> Result<Vec<f64>> {
        self.expect(&Token::LParen)?;
        let mut values = Vec::new();
        loop {
            values.push(self.expect_number()?);
            match self.next()? {
                Token::Comma => continue,
                Token::RParen => break,
                token => return Err(self.error(format!("expected ',' or ')', found {token:?}"))),
            }
        }
        Ok(values)
    }

    /// Comma-separated names until the closing parenthesis (already past
    /// the opening one).
    fn name_list_until_rparen(&mut self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        loop {
            names.push(self.expect_name()?);
            match self.next()? {
                Token::Comma => continue,
                Token::RParen => break,
                token => return Err(self.error(format!("expected ',' or ')', found {token:?}"))),
            }
        }
        Ok(names)
    }

    /// `(a, b)` or a single bare name.
    fn name_group(&mut self) -> Result<Vec<String>> {
        if self.peek() == Some(Token::LParen) {
            self.expect(&Token::LParen)?;
            self.name_list_until_rparen()
        } else {
            Ok(vec![self.expect_name()?])
        }
    }

    /// `{dim, dim}`
    fn dimension_braces(&mut self) -> Result<Vec<DimensionType>> {
        self.expect(&Token::LBrace)?;
        let mut dimensions = Vec::new();
        loop {
            dimensions.push(self.expect_dimension()?);
            match self.next()? {
                Token::Comma => continue,
                Token::RBrace => break,
                token => return Err(self.error(format!("expected ',' or '}}', found {token:?}"))),
            }
        }
        Ok(dimensions)
    }

    fn comparison_op(&mut self) -> Result<ComparisonOp> {
        let position = self.position();
        match self.next()? {
            Token::EqEq => Ok(ComparisonOp::Eq),
            Token::NotEq => Ok(ComparisonOp::Ne),
            Token::Lt => Ok(ComparisonOp::Lt),
            Token::Le => Ok(ComparisonOp::Le),
            Token::Gt => Ok(ComparisonOp::Gt),
            Token::Ge => Ok(ComparisonOp::Ge),
            token => Err(PipelineError::script(
                position,
                format!("expected a comparison operator, found {token:?}"),
            )),
        }
    }

    fn parse_clause(&mut self) -> Result<Operation> {
        // index{dimension} ... is an index filter.
        if self.peek() == Some(Token::Ident("index".to_string()))
            && self.peek_at(1) == Some(Token::LBrace)
        {
            return self.parse_index_filter();
        }
        // A function call is an identifier followed by '('.
        if matches!(self.peek(), Some(Token::Ident(_))) && self.peek_at(1) == Some(Token::LParen) {
            return self.parse_function();
        }
        self.parse_value_filter()
    }

    fn parse_index_filter(&mut self) -> Result<Operation> {
        self.expect_ident()?; // "index"
        self.expect(&Token::LBrace)?;
        let dimension = self.expect_dimension()?;
        self.expect(&Token::RBrace)?;

        if let Some(op) = self.maybe_membership_op()? {
            self.expect(&Token::LParen)?;
            let mut values = Vec::new();
            loop {
                values.push(self.expect_int()?);
                match self.next()? {
                    Token::Comma => continue,
                    Token::RParen => break,
                    token => {
                        return Err(self.error(format!("expected ',' or ')', found {token:?}")));
                    }
                }
            }
            return Ok(Operation::IndexMembershipFilter { dimension, op, values });
        }

        let op = self.comparison_op()?;
        let value = self.expect_int()?;
        Ok(Operation::IndexComparisonFilter { dimension, op, value })
    }

    /// `in` / `not in`, if present.
    fn maybe_membership_op(&mut self) -> Result<Option<MembershipOp>> {
        match self.peek() {
            Some(Token::Ident(word)) if word == "in" => {
                self.next()?;
                Ok(Some(MembershipOp::In))
            }
            Some(Token::Ident(word)) if word == "not" => {
                self.next()?;
                let position = self.position();
                match self.next()? {
                    Token::Ident(word) if word == "in" => Ok(Some(MembershipOp::NotIn)),
                    token => Err(PipelineError::script(
                        position,
                        format!("expected 'in' after 'not', found {token:?}"),
                    )),
                }
            }
            _ => Ok(None),
        }
    }

    fn parse_value_filter(&mut self) -> Result<Operation> {
        let variable = self.expect_ident()?;

        if let Some(op) = self.maybe_membership_op()? {
            self.expect(&Token::LParen)?;
            // String membership if the first value is a string.
            if matches!(self.peek(), Some(Token::Str(_))) {
                let mut values = Vec::new();
                loop {
                    values.push(self.expect_string()?);
                    match self.next()? {
                        Token::Comma => continue,
                        Token::RParen => break,
                        token => {
                            return Err(self.error(format!("expected ',' or ')', found {token:?}")));
                        }
                    }
                }
                return Ok(Operation::StringMembershipFilter { variable, op, values });
            }
            let mut values = Vec::new();
            loop {
                values.push(self.expect_number()?);
                match self.next()? {
                    Token::Comma => continue,
                    Token::RParen => break,
                    token => {
                        return Err(self.error(format!("expected ',' or ')', found {token:?}")));
                    }
                }
            }
            let unit = self.maybe_unit();
            return Ok(Operation::MembershipFilter { variable, op, values, unit });
        }

        match self.peek() {
            Some(Token::EqAmp) | Some(Token::EqPipe) | Some(Token::NotAmp) => {
                let op = match self.next()? {
                    Token::EqAmp => BitMaskOp::All,
                    Token::EqPipe => BitMaskOp::Any,
                    _ => BitMaskOp::None,
                };
                let position = self.position();
                let mask = self.expect_int()?;
                let mask = u32::try_from(mask).map_err(|_| {
                    PipelineError::script(position, format!("bit mask {mask} out of range"))
                })?;
                Ok(Operation::BitMaskFilter { variable, op, mask })
            }
            _ => {
                let op = self.comparison_op()?;
                if matches!(self.peek(), Some(Token::Str(_))) {
                    let value = self.expect_string()?;
                    return Ok(Operation::StringComparisonFilter { variable, op, value });
                }
                let value = self.expect_number()?;
                let unit = self.maybe_unit();
                Ok(Operation::ComparisonFilter { variable, op, value, unit })
            }
        }
    }

    /// `(lats) [unit]?, (lons) [unit]?` — the inline polygon form shared
    /// by the area functions.
    fn inline_polygon(&mut self) -> Result<AreaSpec> {
        let latitudes = self.number_list()?;
        let latitude_unit = self.maybe_unit();
        self.expect(&Token::Comma)?;
        let longitudes = self.number_list()?;
        let longitude_unit = self.maybe_unit();
        Operation::inline_area(
            &latitudes,
            latitude_unit.as_deref(),
            &longitudes,
            longitude_unit.as_deref(),
        )
        .map_err(|e| PipelineError::script(self.position(), e.to_string()))
    }

    /// Area argument: `"file"` or an inline polygon.
    fn area_spec(&mut self) -> Result<AreaSpec> {
        if matches!(self.peek(), Some(Token::Str(_))) {
            Ok(AreaSpec::File(self.expect_string()?))
        } else {
            self.inline_polygon()
        }
    }

    fn parse_function(&mut self) -> Result<Operation> {
        let position = self.position();
        let name = self.expect_ident()?.replace('-', "_");
        self.expect(&Token::LParen)?;

        let operation = match name.as_str() {
            "valid" | "invalid" => {
                let variable = self.expect_ident()?;
                self.expect(&Token::RParen)?;
                return Ok(Operation::ValidRangeFilter { variable, invert: name == "invalid" });
            }
            "longitude_range" => {
                let min = self.expect_number()?;
                let min_unit = self.maybe_unit();
                self.expect(&Token::Comma)?;
                let max = self.expect_number()?;
                let max_unit = self.maybe_unit();
                self.expect(&Token::RParen)?;
                return Operation::longitude_range(
                    min,
                    min_unit.as_deref(),
                    max,
                    max_unit.as_deref(),
                )
                .map_err(|e| PipelineError::script(position, e.to_string()));
            }
            "point_distance" => {
                let latitude = self.expect_number()?;
                let latitude_unit = self.maybe_unit();
                self.expect(&Token::Comma)?;
                let longitude = self.expect_number()?;
                let longitude_unit = self.maybe_unit();
                self.expect(&Token::Comma)?;
                let distance = self.expect_number()?;
                let distance_unit = self.maybe_unit();
                self.expect(&Token::RParen)?;
                return Operation::point_distance(
                    latitude,
                    latitude_unit.as_deref(),
                    longitude,
                    longitude_unit.as_deref(),
                    distance,
                    distance_unit.as_deref(),
                )
                .map_err(|e| PipelineError::script(position, e.to_string()));
            }
            "point_in_area" => {
                let area = self.area_spec()?;
                Operation::PointInAreaFilter { area }
            }
            "area_covers_area" => {
                let area = self.area_spec()?;
                Operation::AreaCoversArea { area }
            }
            "area_inside_area" => {
                let area = self.area_spec()?;
                Operation::AreaInsideArea { area }
            }
            "area_intersects_area" => {
                let area = self.area_spec()?;
                let min_fraction = if self.peek() == Some(Token::Comma) {
                    self.next()?;
                    Some(self.expect_number()?)
                } else {
                    None
                };
                Operation::AreaIntersectsArea { area, min_fraction }
            }
            "area_covers_point" => {
                let latitude = self.expect_number()?;
                let latitude_unit = self.maybe_unit();
                self.expect(&Token::Comma)?;
                let longitude = self.expect_number()?;
                let longitude_unit = self.maybe_unit();
                self.expect(&Token::RParen)?;
                return Operation::area_covers_point(
                    latitude,
                    latitude_unit.as_deref(),
                    longitude,
                    longitude_unit.as_deref(),
                )
                .map_err(|e| PipelineError::script(position, e.to_string()));
            }
            "collocate_left" | "collocate_right" => {
                let filename = self.expect_string()?;
                let index_range = if self.peek() == Some(Token::Comma) {
                    self.next()?;
                    let min = self.expect_int()?;
                    self.expect(&Token::Comma)?;
                    let max = self.expect_int()?;
                    Some((min, max))
                } else {
                    None
                };
                Operation::CollocationFilter {
                    filename,
                    side: if name == "collocate_left" {
                        CollocationSide::A
                    } else {
                        CollocationSide::B
                    },
                    index_range,
                }
            }
            "keep" => Operation::KeepVariable { patterns: self.name_list_until_rparen()? },
            "exclude" => Operation::ExcludeVariable { patterns: self.name_list_until_rparen()? },
            "rename" => {
                let from = self.expect_name()?;
                self.expect(&Token::Comma)?;
                let to = self.expect_name()?;
                Operation::Rename { from, to }
            }
            "sort" => Operation::Sort { variables: self.name_list_until_rparen()? },
            "squash" => {
                let dimension = self.expect_dimension()?;
                self.expect(&Token::Comma)?;
                let variables = self.name_group()?;
                Operation::Squash { dimension, variables }
            }
            "flatten" => Operation::Flatten { dimension: self.expect_dimension()? },
            "clamp" => {
                let dimension = self.expect_dimension()?;
                self.expect(&Token::Comma)?;
                let axis_variable = self.expect_name()?;
                let axis_unit = self.maybe_unit();
                self.expect(&Token::Comma)?;
                let lower = self.expect_number()?;
                self.expect(&Token::Comma)?;
                let upper = self.expect_number()?;
                Operation::Clamp { dimension, axis_variable, axis_unit, bounds: [lower, upper] }
            }
            "wrap" => {
                let variable = self.expect_name()?;
                let unit = self.maybe_unit();
                self.expect(&Token::Comma)?;
                let min = self.expect_number()?;
                self.expect(&Token::Comma)?;
                let max = self.expect_number()?;
                Operation::Wrap { variable, unit, min, max }
            }
            "derive" => {
                let variable = self.expect_ident()?;
                let data_type = match self.peek() {
                    Some(Token::Ident(word)) => match DataType::from_str(&word) {
                        Ok(data_type) => {
                            self.next()?;
                            Some(data_type)
                        }
                        Err(_) => {
                            return Err(self.error(format!("unknown data type '{word}'")));
                        }
                    },
                    _ => None,
                };
                let dimensions = if self.peek() == Some(Token::LBrace) {
                    Some(self.dimension_braces()?)
                } else {
                    None
                };
                let unit = self.maybe_unit();
                Operation::DeriveVariable { variable, data_type, dimensions, unit }
            }
            "bin" => {
                if self.peek() == Some(Token::RParen) {
                    Operation::BinFull
                } else {
                    Operation::BinWithVariables { variables: self.name_list_until_rparen()? }
                }
            }
            "bin_spatial" => {
                let latitude_edges = self.number_list()?;
                self.expect(&Token::Comma)?;
                let longitude_edges = self.number_list()?;
                self.expect(&Token::RParen)?;
                return Operation::bin_spatial(latitude_edges, longitude_edges)
                    .map_err(|e| PipelineError::script(position, e.to_string()));
            }
            "bin_collocated" => {
                let collocation_result = self.expect_string()?;
                self.expect(&Token::Comma)?;
                let target = self.expect_side()?;
                Operation::BinCollocated { collocation_result, target }
            }
            "regrid" => {
                let dimension = self.expect_dimension()?;
                self.expect(&Token::Comma)?;
                let axis_variable = self.expect_name()?;
                let axis_unit = self.maybe_unit();
                self.expect(&Token::Comma)?;
                let values = self.number_list()?;
                let bounds = if self.peek() == Some(Token::Comma) {
                    self.next()?;
                    Some(self.number_list()?)
                } else {
                    None
                };
                Operation::Regrid { dimension, axis_variable, axis_unit, values, bounds }
            }
            "rebin" => {
                let dimension = self.expect_dimension()?;
                self.expect(&Token::Comma)?;
                let axis_variable = self.expect_name()?;
                let axis_unit = self.maybe_unit();
                self.expect(&Token::Comma)?;
                let edges = self.number_list()?;
                Operation::Rebin { dimension, axis_variable, axis_unit, edges }
            }
            "regrid_collocated_dataset" => {
                let dimension = self.expect_dimension()?;
                self.expect(&Token::Comma)?;
                let axis_variable = self.expect_name()?;
                let axis_unit = self.maybe_unit();
                self.expect(&Token::Comma)?;
                let collocation_result = self.expect_string()?;
                self.expect(&Token::Comma)?;
                let target = self.expect_side()?;
                self.expect(&Token::Comma)?;
                let dataset_dir = self.expect_string()?;
                Operation::RegridCollocatedDataset {
                    dimension,
                    axis_variable,
                    axis_unit,
                    collocation_result,
                    target,
                    dataset_dir,
                }
            }
            "regrid_collocated_product" => {
                let dimension = self.expect_dimension()?;
                self.expect(&Token::Comma)?;
                let axis_variable = self.expect_name()?;
                let axis_unit = self.maybe_unit();
                self.expect(&Token::Comma)?;
                let filename = self.expect_string()?;
                Operation::RegridCollocatedProduct { dimension, axis_variable, axis_unit, filename }
            }
            "smooth" => {
                let variables = self.name_group()?;
                self.expect(&Token::Comma)?;
                let dimension = self.expect_dimension()?;
                self.expect(&Token::Comma)?;
                let axis_variable = self.expect_name()?;
                let axis_unit = self.maybe_unit();
                self.expect(&Token::Comma)?;
                let collocation_result = self.expect_string()?;
                self.expect(&Token::Comma)?;
                let target = self.expect_side()?;
                self.expect(&Token::Comma)?;
                let dataset_dir = self.expect_string()?;
                Operation::SmoothCollocatedDataset {
                    variables,
                    dimension,
                    axis_variable,
                    axis_unit,
                    collocation_result,
                    target,
                    dataset_dir,
                }
            }
            "smooth_collocated_product" => {
                let variables = self.name_group()?;
                self.expect(&Token::Comma)?;
                let dimension = self.expect_dimension()?;
                self.expect(&Token::Comma)?;
                let axis_variable = self.expect_name()?;
                let axis_unit = self.maybe_unit();
                self.expect(&Token::Comma)?;
                let filename = self.expect_string()?;
                Operation::SmoothCollocatedProduct {
                    variables,
                    dimension,
                    axis_variable,
                    axis_unit,
                    filename,
                }
            }
            "derive_smoothed_column" => {
                let variable = self.expect_ident()?;
                let dimensions = self.dimension_braces()?;
                let unit = self.maybe_unit();
                self.expect(&Token::Comma)?;
                let axis_variable = self.expect_name()?;
                let axis_unit = self.maybe_unit();
                self.expect(&Token::Comma)?;
                let collocation_result = self.expect_string()?;
                self.expect(&Token::Comma)?;
                let target = self.expect_side()?;
                self.expect(&Token::Comma)?;
                let dataset_dir = self.expect_string()?;
                Operation::DeriveSmoothedColumnCollocatedDataset {
                    variable,
                    dimensions,
                    unit,
                    axis_variable,
                    axis_unit,
                    collocation_result,
                    target,
                    dataset_dir,
                }
            }
            "derive_smoothed_column_collocated_product" => {
                let variable = self.expect_ident()?;
                let dimensions = self.dimension_braces()?;
                let unit = self.maybe_unit();
                self.expect(&Token::Comma)?;
                let axis_variable = self.expect_name()?;
                let axis_unit = self.maybe_unit();
                self.expect(&Token::Comma)?;
                let filename = self.expect_string()?;
                Operation::DeriveSmoothedColumnCollocatedProduct {
                    variable,
                    dimensions,
                    unit,
                    axis_variable,
                    axis_unit,
                    filename,
                }
            }
            "set" => {
                let option = self.expect_name()?;
                self.expect(&Token::Comma)?;
                let value = self.expect_name()?;
                Operation::Set { option, value }
            }
            _ => {
                return Err(PipelineError::script(
                    position,
                    format!("unknown function '{name}'"),
                ));
            }
        };

        self.expect(&Token::RParen)?;
        Ok(operation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SphericalPoint;

    #[test]
    fn parses_a_filter_chain() {
        let operations = parse_operations("t>15;t<40").unwrap();
        assert_eq!(
            operations,
            vec![
                Operation::ComparisonFilter {
                    variable: "t".to_string(),
                    op: ComparisonOp::Gt,
                    value: 15.0,
                    unit: None,
                },
                Operation::ComparisonFilter {
                    variable: "t".to_string(),
                    op: ComparisonOp::Lt,
                    value: 40.0,
                    unit: None,
                },
            ]
        );
    }

    #[test]
    fn parses_point_distance_with_units() {
        let operations =
            parse_operations("point-distance(20[degree_north],10[degree_east],1200[km])").unwrap();
        assert_eq!(
            operations,
            vec![Operation::PointDistanceFilter {
                point: SphericalPoint::new(20.0, 10.0),
                distance_m: 1_200_000.0,
            }]
        );
    }

    #[test]
    fn parses_keep_and_exclude_with_wildcards() {
        let operations = parse_operations("keep(time,t*);exclude(tmp_*)").unwrap();
        assert_eq!(
            operations,
            vec![
                Operation::KeepVariable {
                    patterns: vec!["time".to_string(), "t*".to_string()],
                },
                Operation::ExcludeVariable { patterns: vec!["tmp_*".to_string()] },
            ]
        );
    }

    #[test]
    fn parses_membership_variants() {
        let operations =
            parse_operations(r#"o3 in (1.5, 2.5) [ppmv]; name not in ("x", "y")"#).unwrap();
        assert_eq!(
            operations,
            vec![
                Operation::MembershipFilter {
                    variable: "o3".to_string(),
                    op: MembershipOp::In,
                    values: vec![1.5, 2.5],
                    unit: Some("ppmv".to_string()),
                },
                Operation::StringMembershipFilter {
                    variable: "name".to_string(),
                    op: MembershipOp::NotIn,
                    values: vec!["x".to_string(), "y".to_string()],
                },
            ]
        );
    }

    #[test]
    fn parses_index_filters() {
        let operations = parse_operations("index{time} < 4; index{vertical} in (0, 2)").unwrap();
        assert_eq!(
            operations,
            vec![
                Operation::IndexComparisonFilter {
                    dimension: DimensionType::Time,
                    op: ComparisonOp::Lt,
                    value: 4,
                },
                Operation::IndexMembershipFilter {
                    dimension: DimensionType::Vertical,
                    op: MembershipOp::In,
                    values: vec![0, 2],
                },
            ]
        );
    }

    #[test]
    fn parses_derive_with_type_dims_and_unit() {
        let operations = parse_operations("derive(altitude double {time, vertical} [km])").unwrap();
        assert_eq!(
            operations,
            vec![Operation::DeriveVariable {
                variable: "altitude".to_string(),
                data_type: Some(DataType::Double),
                dimensions: Some(vec![DimensionType::Time, DimensionType::Vertical]),
                unit: Some("km".to_string()),
            }]
        );
    }

    #[test]
    fn parses_collocation_filter_with_window() {
        let operations = parse_operations(r#"collocate-right("pairs.csv", 10, 20)"#).unwrap();
        assert_eq!(
            operations,
            vec![Operation::CollocationFilter {
                filename: "pairs.csv".to_string(),
                side: CollocationSide::B,
                index_range: Some((10, 20)),
            }]
        );
    }

    #[test]
    fn parses_bit_mask_and_valid_filters() {
        let operations = parse_operations("flags =& 5; valid(o3); invalid(no2)").unwrap();
        assert_eq!(
            operations,
            vec![
                Operation::BitMaskFilter {
                    variable: "flags".to_string(),
                    op: BitMaskOp::All,
                    mask: 5,
                },
                Operation::ValidRangeFilter { variable: "o3".to_string(), invert: false },
                Operation::ValidRangeFilter { variable: "no2".to_string(), invert: true },
            ]
        );
    }

    #[test]
    fn parses_inline_area() {
        let operations =
            parse_operations("point-in-area((0, 0, 10, 10), (0, 10, 10, 0))").unwrap();
        assert_eq!(operations.len(), 1);
        let Operation::PointInAreaFilter { area: AreaSpec::Inline(mask) } = &operations[0] else {
            panic!("expected an inline area");
        };
        assert_eq!(mask.polygons().len(), 1);
        assert_eq!(mask.polygons()[0].num_vertices(), 4);
    }

    #[test]
    fn parses_set_and_bin() {
        let operations =
            parse_operations("set(afgl86, usstd76); bin(); bin(lat, lon)").unwrap();
        assert_eq!(
            operations,
            vec![
                Operation::Set {
                    option: "afgl86".to_string(),
                    value: "usstd76".to_string(),
                },
                Operation::BinFull,
                Operation::BinWithVariables {
                    variables: vec!["lat".to_string(), "lon".to_string()],
                },
            ]
        );
    }

    #[test]
    fn parses_regrid_with_bounds() {
        let operations =
            parse_operations("regrid(vertical, altitude [km], (1, 2, 3), (0.5, 1.5, 2.5, 3.5))")
                .unwrap();
        assert_eq!(
            operations,
            vec![Operation::Regrid {
                dimension: DimensionType::Vertical,
                axis_variable: "altitude".to_string(),
                axis_unit: Some("km".to_string()),
                values: vec![1.0, 2.0, 3.0],
                bounds: Some(vec![0.5, 1.5, 2.5, 3.5]),
            }]
        );
    }

    #[test]
    fn reports_unknown_function_with_position() {
        let error = parse_operations("t>1; frobnicate(x)").unwrap_err();
        match error {
            PipelineError::Script { position, message } => {
                assert_eq!(position, 5);
                assert!(message.contains("frobnicate"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn rejects_malformed_literals() {
        assert!(parse_operations("t > )").is_err());
        assert!(parse_operations("keep(").is_err());
        assert!(parse_operations("index{sideways} > 1").is_err());
    }
}
