use serde_json::json;

pub static EXTRACTION_SYSTEM_MESSAGE: &str = "\
You extract a knowledge graph from one chunk of a document.

Identify the distinct concepts the chunk discusses. For each concept return \
a short noun-phrase label, a one-paragraph description grounded in the chunk, \
a handful of alternative surface forms as search terms, and one or more \
evidence instances. Every instance quote MUST be copied verbatim from the \
chunk, and char_offset_start/char_offset_end MUST be the byte offsets of the \
quote within the chunk text.

Then propose typed relationships between the concepts you returned, using \
from_label/to_label to reference their labels. Choose rel_type from the \
provided vocabulary; only introduce a new type when no vocabulary entry \
fits. Confidence is your certainty in the relationship, between 0 and 1.

Return only the structured object; no commentary.";

pub static IMAGE_DESCRIPTION_PROMPT: &str = "\
Describe this image as a dense, factual text document. Name every entity, \
relationship, quantity and piece of text visible, so the description can be \
ingested in place of the image.";

/// Strict JSON schema for the chunk extraction response.
pub fn extraction_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "concepts": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "label": { "type": "string" },
                        "description": { "type": "string" },
                        "search_terms": {
                            "type": "array",
                            "items": { "type": "string" }
                        },
                        "instances": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "properties": {
                                    "quote": { "type": "string" },
                                    "char_offset_start": { "type": "integer" },
                                    "char_offset_end": { "type": "integer" }
                                },
                                "required": ["quote", "char_offset_start", "char_offset_end"],
                                "additionalProperties": false
                            }
                        }
                    },
                    "required": ["label", "description", "search_terms", "instances"],
                    "additionalProperties": false
                }
            },
            "relationships": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "from_label": { "type": "string" },
                        "to_label": { "type": "string" },
                        "rel_type": { "type": "string" },
                        "confidence": { "type": "number" }
                    },
                    "required": ["from_label", "to_label", "rel_type", "confidence"],
                    "additionalProperties": false
                }
            }
        },
        "required": ["concepts", "relationships"],
        "additionalProperties": false
    })
}
