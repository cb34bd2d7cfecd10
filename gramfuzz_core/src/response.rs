//! Structured answers returned by the oracle for binary protocols.
//!
//! Schema failures (invalid JSON, a missing required key) are recoverable: they are
//! logged and the caller receives an empty result.

use crate::binary::StructuredHexChunk;
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use tracing::warn;

/// The structured answers the oracle is asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSchema {
    /// `{"hex_dump_message": [string]}`: a hex sequence split into messages.
    SplitMessages,
    /// `{"structured_hex_dump_message": [{"hex_dump": string, "mutable": 0|1}]}`.
    MutableFields,
    /// `{"client_request_method": [string]}`.
    ClientRequestMethods,
    /// `{"client_request_byte_sequence_string": string}`.
    EnrichedSequence,
}

impl ResponseSchema {
    pub fn name(&self) -> &'static str {
        match self {
            ResponseSchema::SplitMessages => "hex_dump_message_sequence",
            ResponseSchema::MutableFields => "structured_protocol_hex_dump_message",
            ResponseSchema::ClientRequestMethods => "client_request_method_list",
            ResponseSchema::EnrichedSequence => "client_request_byte_sequence_string",
        }
    }

    fn schema(&self) -> JsonValue {
        match self {
            ResponseSchema::SplitMessages => json!({
                "type": "object",
                "properties": {
                    "hex_dump_message": { "type": "array", "items": { "type": "string" } }
                },
                "required": ["hex_dump_message"],
                "additionalProperties": false
            }),
            ResponseSchema::MutableFields => json!({
                "type": "object",
                "properties": {
                    "structured_hex_dump_message": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "hex_dump": { "type": "string" },
                                "mutable": {
                                    "type": "integer",
                                    "description": "0 is not functions correctly and 1 is functions correctly even if the fields are mutated.",
                                    "enum": [0, 1]
                                }
                            },
                            "required": ["hex_dump", "mutable"],
                            "additionalProperties": false
                        }
                    }
                },
                "required": ["structured_hex_dump_message"],
                "additionalProperties": false
            }),
            ResponseSchema::ClientRequestMethods => json!({
                "type": "object",
                "properties": {
                    "client_request_method": { "type": "array", "items": { "type": "string" } }
                },
                "required": ["client_request_method"],
                "additionalProperties": false
            }),
            ResponseSchema::EnrichedSequence => json!({
                "type": "object",
                "properties": {
                    "client_request_byte_sequence_string": { "type": "string" }
                },
                "required": ["client_request_byte_sequence_string"],
                "additionalProperties": false
            }),
        }
    }

    /// The strict `response_format` value sent with a chat request.
    pub fn response_format(&self) -> JsonValue {
        json!({
            "type": "json_schema",
            "json_schema": {
                "name": self.name(),
                "schema": self.schema(),
                "strict": true
            }
        })
    }
}

#[derive(Deserialize)]
struct SplitMessagesAnswer {
    hex_dump_message: Vec<String>,
}

#[derive(Deserialize)]
struct MutableFieldsAnswer {
    structured_hex_dump_message: Vec<RawChunk>,
}

#[derive(Deserialize)]
struct RawChunk {
    hex_dump: Option<String>,
    mutable: Option<i64>,
}

#[derive(Deserialize)]
struct ClientRequestMethodsAnswer {
    client_request_method: Vec<String>,
}

#[derive(Deserialize)]
struct EnrichedSequenceAnswer {
    client_request_byte_sequence_string: String,
}

fn parse<T: for<'de> Deserialize<'de>>(response: &str, schema: ResponseSchema) -> Option<T> {
    match serde_json::from_str(response) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            warn!(schema = schema.name(), error = %e, "Oracle answer does not follow the schema");
            None
        }
    }
}

fn remove_whitespace(text: &str) -> String {
    text.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Individual hex messages of a split sequence, with whitespace removed.
pub fn parse_split_messages(response: &str) -> Vec<String> {
    parse::<SplitMessagesAnswer>(response, ResponseSchema::SplitMessages)
        .map(|answer| {
            answer
                .hex_dump_message
                .iter()
                .map(|message| remove_whitespace(message))
                .collect()
        })
        .unwrap_or_default()
}

/// The chunk decomposition of one binary message. Items missing either key are
/// skipped; any non-zero `mutable` counts as mutable.
pub fn parse_mutable_fields(response: &str) -> Vec<StructuredHexChunk> {
    let Some(answer) = parse::<MutableFieldsAnswer>(response, ResponseSchema::MutableFields)
    else {
        return Vec::new();
    };

    answer
        .structured_hex_dump_message
        .into_iter()
        .enumerate()
        .filter_map(|(index, chunk)| match (chunk.hex_dump, chunk.mutable) {
            (Some(hex_text), Some(mutable)) => Some(StructuredHexChunk {
                hex_text,
                is_mutable: mutable != 0,
            }),
            (None, _) => {
                warn!(index, "Chunk is missing hex_dump, skipping");
                None
            }
            (_, None) => {
                warn!(index, "Chunk is missing mutable, skipping");
                None
            }
        })
        .collect()
}

/// Client request method names, trimmed, empties dropped.
pub fn parse_client_request_methods(response: &str) -> Vec<String> {
    parse::<ClientRequestMethodsAnswer>(response, ResponseSchema::ClientRequestMethods)
        .map(|answer| {
            answer
                .client_request_method
                .into_iter()
                .map(|method| method.trim().to_string())
                .filter(|method| !method.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// The enriched byte sequence, whitespace removed. `None` on schema failure.
pub fn parse_enriched_sequence(response: &str) -> Option<String> {
    parse::<EnrichedSequenceAnswer>(response, ResponseSchema::EnrichedSequence)
        .map(|answer| remove_whitespace(&answer.client_request_byte_sequence_string))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_messages_removes_whitespace() {
        let response = r#"{"hex_dump_message": ["00 01 02", "ab\ncd"]}"#;
        assert_eq!(parse_split_messages(response), vec!["000102", "abcd"]);
    }

    #[test]
    fn split_messages_missing_key_is_empty() {
        assert!(parse_split_messages(r#"{"messages": []}"#).is_empty());
        assert!(parse_split_messages("not json").is_empty());
    }

    #[test]
    fn mutable_fields_parse_flags() {
        let response = r#"{"structured_hex_dump_message": [
            {"hex_dump": "1234", "mutable": 0},
            {"hex_dump": "0100", "mutable": 1}
        ]}"#;
        assert_eq!(
            parse_mutable_fields(response),
            vec![
                StructuredHexChunk::new("1234", false),
                StructuredHexChunk::new("0100", true),
            ]
        );
    }

    #[test]
    fn mutable_fields_skip_incomplete_items() {
        let response = r#"{"structured_hex_dump_message": [
            {"hex_dump": "aa"},
            {"mutable": 1},
            {"hex_dump": "bb", "mutable": 1}
        ]}"#;
        assert_eq!(
            parse_mutable_fields(response),
            vec![StructuredHexChunk::new("bb", true)]
        );
    }

    #[test]
    fn mutable_fields_missing_key_is_empty() {
        assert!(parse_mutable_fields(r#"{"fields": []}"#).is_empty());
    }

    #[test]
    fn client_request_methods_are_trimmed() {
        let response = r#"{"client_request_method": [" QUERY ", "", "UPDATE"]}"#;
        assert_eq!(parse_client_request_methods(response), vec!["QUERY", "UPDATE"]);
        assert!(parse_client_request_methods("{}").is_empty());
    }

    #[test]
    fn enriched_sequence_is_compacted() {
        let response = r#"{"client_request_byte_sequence_string": "de ad be ef"}"#;
        assert_eq!(parse_enriched_sequence(response).as_deref(), Some("deadbeef"));
        assert_eq!(parse_enriched_sequence("[]"), None);
    }

    #[test]
    fn response_format_wraps_strict_schema() {
        let format = ResponseSchema::MutableFields.response_format();
        assert_eq!(format["type"], "json_schema");
        assert_eq!(format["json_schema"]["name"], "structured_protocol_hex_dump_message");
        assert_eq!(format["json_schema"]["strict"], true);
        assert_eq!(
            format["json_schema"]["schema"]["required"][0],
            "structured_hex_dump_message"
        );
    }
}
