//! Parsing of human-readable event signatures.
//!
//! Configuration declares events the way Solidity does:
//! `"Transfer(address indexed from, address indexed to, uint256 value)"`.
//! Named tuples are supported, including nesting:
//! `"Swap((address currency0, address currency1) key, uint256 amount)"`.

use alloy::dyn_abi::DynSolType;
use alloy::primitives::{keccak256, B256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EventParseError {
    #[error("invalid event signature: {0}")]
    InvalidSignature(String),
    #[error("failed to parse type '{0}': {1}")]
    TypeParse(String, String),
    #[error("missing closing parenthesis")]
    MissingCloseParen,
    #[error("invalid tuple format: {0}")]
    InvalidTuple(String),
    #[error("empty tuple field")]
    EmptyField,
}

/// Field names within a tuple parameter (supports nesting).
#[derive(Debug, Clone)]
pub enum TupleFieldInfo {
    Leaf,
    Tuple(Vec<(String, TupleFieldInfo)>),
}

/// One parsed event parameter.
#[derive(Debug, Clone)]
pub struct EventParam {
    pub name: String,
    pub param_type: DynSolType,
    pub type_string: String,
    pub indexed: bool,
    /// `Some(Tuple(..))` for tuple parameters, carrying field names in order.
    pub tuple_fields: Option<TupleFieldInfo>,
}

/// Parsed event definition with its topic0.
#[derive(Debug, Clone)]
pub struct ParsedEvent {
    pub name: String,
    pub signature: String,
    pub canonical_signature: String,
    pub topic0: B256,
    pub params: Vec<EventParam>,
}

impl ParsedEvent {
    pub fn from_signature(signature: &str) -> Result<Self, EventParseError> {
        let signature = signature.trim();

        let Some((name, rest)) = signature.split_once('(') else {
            return Err(EventParseError::InvalidSignature(signature.to_string()));
        };
        let name = name.trim();
        if name.is_empty() {
            return Err(EventParseError::InvalidSignature(
                "empty event name".to_string(),
            ));
        }

        let (param_list, trailer) = body_and_trailer(rest)?;
        if !trailer.trim().is_empty() {
            return Err(EventParseError::InvalidSignature(format!(
                "unexpected input after parameter list: '{}'",
                trailer.trim()
            )));
        }

        let mut params = Vec::new();
        if !param_list.trim().is_empty() {
            for piece in split_outside_parens(param_list)? {
                params.push(parse_param(piece)?);
            }
        }

        // Canonical form: types only, no names, no "indexed".
        let type_strings: Vec<&str> = params.iter().map(|p| p.type_string.as_str()).collect();
        let canonical_signature = format!("{}({})", name, type_strings.join(","));
        let topic0 = keccak256(canonical_signature.as_bytes());

        Ok(ParsedEvent {
            name: name.to_string(),
            signature: signature.to_string(),
            canonical_signature,
            topic0,
            params,
        })
    }

    pub fn indexed_params(&self) -> impl Iterator<Item = &EventParam> {
        self.params.iter().filter(|p| p.indexed)
    }

    pub fn data_params(&self) -> impl Iterator<Item = &EventParam> {
        self.params.iter().filter(|p| !p.indexed)
    }
}

/// Split text that FOLLOWS an opening parenthesis into the parenthesized
/// body and whatever comes after the matching close paren.
fn body_and_trailer(text: &str) -> Result<(&str, &str), EventParseError> {
    let mut depth = 1usize;
    for (i, c) in text.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Ok((&text[..i], &text[i + 1..]));
                }
            }
            _ => {}
        }
    }
    Err(EventParseError::MissingCloseParen)
}

/// Comma-separated pieces of `text`, treating commas inside parentheses as
/// part of the current piece. Rejects unbalanced input.
fn split_outside_parens(text: &str) -> Result<Vec<&str>, EventParseError> {
    let mut pieces = Vec::new();
    let mut depth = 0u32;
    let mut piece_start = 0;

    for (i, c) in text.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| EventParseError::InvalidTuple(text.to_string()))?;
            }
            ',' if depth == 0 => {
                pieces.push(&text[piece_start..i]);
                piece_start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(EventParseError::MissingCloseParen);
    }
    pieces.push(&text[piece_start..]);
    Ok(pieces)
}

/// One parameter: either `type [indexed] [name]` or a named tuple,
/// `(type name, ...) [indexed] [name]`.
fn parse_param(text: &str) -> Result<EventParam, EventParseError> {
    let text = text.trim();

    if let Some(rest) = text.strip_prefix('(') {
        let (body, trailer) = body_and_trailer(rest)?;
        let (indexed, name) = trailing_modifiers(trailer.split_whitespace())?;
        let (fields, field_types) = parse_named_fields(body)?;

        let type_string = format!("({})", field_types.join(","));
        let param_type = DynSolType::parse(&type_string)
            .map_err(|e| EventParseError::TypeParse(type_string.clone(), e.to_string()))?;

        return Ok(EventParam {
            name,
            param_type,
            type_string,
            indexed,
            tuple_fields: Some(TupleFieldInfo::Tuple(fields)),
        });
    }

    let mut tokens = text.split_whitespace();
    let type_string = tokens
        .next()
        .ok_or_else(|| EventParseError::InvalidSignature("empty parameter".to_string()))?
        .to_string();
    let (indexed, name) = trailing_modifiers(tokens)?;

    let param_type = DynSolType::parse(&type_string)
        .map_err(|e| EventParseError::TypeParse(type_string.clone(), e.to_string()))?;

    Ok(EventParam {
        name,
        param_type,
        type_string,
        indexed,
        tuple_fields: None,
    })
}

/// What may follow a parameter's type: an optional `indexed` keyword, then
/// an optional name. Anything further is malformed.
fn trailing_modifiers<'a>(
    tokens: impl IntoIterator<Item = &'a str>,
) -> Result<(bool, String), EventParseError> {
    let mut indexed = false;
    let mut name: Option<&str> = None;

    for token in tokens {
        if token == "indexed" && !indexed && name.is_none() {
            indexed = true;
        } else if name.is_none() {
            name = Some(token);
        } else {
            return Err(EventParseError::InvalidSignature(format!(
                "unexpected token '{token}' after parameter name"
            )));
        }
    }

    Ok((indexed, name.unwrap_or_default().to_string()))
}

/// The inside of a named tuple: every field is `type name`, where the type
/// may itself be a nested named tuple. Returns the field name tree alongside
/// the canonical type string of each field.
fn parse_named_fields(
    body: &str,
) -> Result<(Vec<(String, TupleFieldInfo)>, Vec<String>), EventParseError> {
    if body.trim().is_empty() {
        return Err(EventParseError::InvalidTuple("empty tuple".to_string()));
    }

    let mut fields = Vec::new();
    let mut field_types = Vec::new();

    for piece in split_outside_parens(body)? {
        let piece = piece.trim();
        if piece.is_empty() {
            return Err(EventParseError::EmptyField);
        }

        if let Some(rest) = piece.strip_prefix('(') {
            let (nested_body, trailer) = body_and_trailer(rest)?;
            let field_name = trailer.split_whitespace().next_back().ok_or_else(|| {
                EventParseError::InvalidTuple(format!("tuple field '{piece}' has no name"))
            })?;

            let (nested_fields, nested_types) = parse_named_fields(nested_body)?;
            fields.push((field_name.to_string(), TupleFieldInfo::Tuple(nested_fields)));
            field_types.push(format!("({})", nested_types.join(",")));
        } else {
            let Some((type_str, field_name)) = piece.split_once(char::is_whitespace) else {
                return Err(EventParseError::InvalidTuple(format!(
                    "field '{piece}' must have a name in a named tuple"
                )));
            };
            let field_name = field_name.trim();

            DynSolType::parse(type_str)
                .map_err(|e| EventParseError::TypeParse(type_str.to_string(), e.to_string()))?;

            fields.push((field_name.to_string(), TupleFieldInfo::Leaf));
            field_types.push(type_str.to_string());
        }
    }

    Ok((fields, field_types))
}
