use crate::core::error::GenerationError;
use crate::core::state::{StoryBook, StoryPage};
use crate::utils::text::collapse_whitespace;
use anyhow::Result;
use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::HashMap;

pub const FALLBACK_PROMPT: &str =
    "A gentle, colorful children's storybook illustration of a peaceful, friendly scene";

// --- Wire records ---

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TextOnlyRecord {
    #[serde(default)]
    pub title: String,
    #[serde(default, alias = "author")]
    pub author_line: String,
    #[serde(default)]
    pub moral: String,
    #[serde(default, deserialize_with = "lenient_sheet")]
    pub character_descriptions: Option<String>,
    pub pages: Vec<TextOnlyPage>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TextOnlyPage {
    #[serde(default, deserialize_with = "lenient_number")]
    pub page_number: Option<i64>,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PromptSheetRecord {
    pub prompts: Vec<PromptEntry>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PromptEntry {
    #[serde(default, deserialize_with = "lenient_number")]
    pub page_number: Option<i64>,
    #[serde(alias = "prompt")]
    pub image_prompt: String,
}

fn lenient_number<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

// Models return the sheet as a string, a list of lines, or a name -> description map.
fn lenient_sheet<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => Some(s),
        Some(Value::Array(items)) => {
            let lines: Vec<String> = items
                .iter()
                .filter_map(|item| match item {
                    Value::String(s) => Some(s.clone()),
                    Value::Object(obj) => {
                        let name = obj.get("name").and_then(Value::as_str)?;
                        let desc = obj
                            .get("description")
                            .or_else(|| obj.get("appearance"))
                            .and_then(Value::as_str)
                            .unwrap_or_default();
                        Some(format!("{} - {}", name, desc))
                    }
                    _ => None,
                })
                .collect();
            Some(lines.join("\n"))
        }
        Some(Value::Object(obj)) => Some(
            obj.iter()
                .filter_map(|(name, desc)| desc.as_str().map(|d| format!("{} - {}", name, d)))
                .collect::<Vec<_>>()
                .join("\n"),
        ),
        _ => None,
    })
}

// --- Envelope strategies ---

type Envelope = fn(&Value) -> Option<Value>;

/// Tried in order against every parsed value; the first that yields the target shape wins.
const ENVELOPES: &[(&str, Envelope)] = &[
    ("direct", direct_envelope),
    ("story", story_envelope),
    ("choices", choices_envelope),
    ("encoded", encoded_envelope),
];

fn direct_envelope(value: &Value) -> Option<Value> {
    Some(value.clone())
}

fn story_envelope(value: &Value) -> Option<Value> {
    match value.get("story")? {
        Value::String(s) => salvage_value(s),
        inner => Some(inner.clone()),
    }
}

fn choices_envelope(value: &Value) -> Option<Value> {
    let content = value
        .get("choices")?
        .get(0)?
        .get("message")?
        .get("content")?;
    let text = match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| match part {
                Value::String(s) => Some(s.clone()),
                Value::Object(_) => part.get("text").and_then(Value::as_str).map(str::to_string),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join(""),
        _ => return None,
    };
    salvage_value(&text)
}

fn encoded_envelope(value: &Value) -> Option<Value> {
    value.as_str().and_then(salvage_value)
}

fn match_shape<T: DeserializeOwned>(value: &Value) -> Option<T> {
    ENVELOPES.iter().find_map(|(name, envelope)| {
        let inner = envelope(value)?;
        match serde_json::from_value::<T>(inner) {
            Ok(record) => {
                debug!("Decoded model response via {} envelope", name);
                Some(record)
            }
            Err(_) => None,
        }
    })
}

// --- Decoding ---

/// Decodes model output into `T`, trying progressively more invasive repairs.
pub fn decode<T: DeserializeOwned>(raw: &str) -> Result<T> {
    let text = strip_code_blocks(raw);
    for candidate in candidates(&text) {
        if let Ok(value) = serde_json::from_str::<Value>(&candidate) {
            if let Some(record) = match_shape::<T>(&value) {
                return Ok(record);
            }
        }
    }

    debug!("Unparsable model response: {}", raw);
    Err(GenerationError::UnparsableResponse(preview(raw)).into())
}

/// Any JSON object or array hidden in `text`, using the same attempt ladder as [`decode`].
fn salvage_value(text: &str) -> Option<Value> {
    let text = strip_code_blocks(text);
    candidates(&text).into_iter().find_map(|candidate| {
        serde_json::from_str::<Value>(&candidate)
            .ok()
            .filter(|v| v.is_object() || v.is_array())
    })
}

// Raw, extracted, repaired, then extracted-and-repaired.
fn candidates(text: &str) -> Vec<String> {
    let mut out = vec![text.to_string()];
    let extracted = extract_object(text);
    if let Some(span) = extracted {
        out.push(span.to_string());
    }
    out.push(repair_json(text));
    // Truncated output keeps its tail; the last `}` would cut it short.
    if let Some(start) = text.find('{') {
        out.push(repair_json(&text[start..]));
    }
    if let Some(span) = extracted {
        out.push(repair_json(span));
    }
    out
}

/// The substring between the first `{` and the last `}`.
pub fn extract_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end > start {
        Some(&text[start..=end])
    } else {
        None
    }
}

/// Closes whatever a token budget cut off: trailing commas, an open string,
/// and every open bracket or brace, innermost first.
pub fn repair_json(input: &str) -> String {
    let mut out = strip_trailing_commas(input.trim());
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in out.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.last() == Some(&c) {
                    stack.pop();
                }
            }
            _ => {}
        }
    }

    if in_string {
        if escaped {
            out.pop();
        }
        out.push('"');
    } else if out.trim_end().ends_with(':') {
        out.push_str("null");
    }

    while let Some(close) = stack.pop() {
        out.push(close);
    }
    out
}

fn strip_trailing_commas(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut in_string = false;
    let mut escaped = false;

    for (i, &c) in chars.iter().enumerate() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        if c == '"' {
            in_string = true;
        } else if c == ',' {
            let next = chars[i + 1..].iter().find(|ch| !ch.is_whitespace());
            if matches!(next, None | Some('}') | Some(']')) {
                continue;
            }
        }
        out.push(c);
    }
    out
}

pub fn strip_code_blocks(s: &str) -> String {
    let s = s.trim();
    if s.starts_with("```json") {
        s.trim_start_matches("```json").trim_end_matches("```").trim().to_string()
    } else if s.starts_with("```") {
        s.trim_start_matches("```").trim_end_matches("```").trim().to_string()
    } else if let Some(start) = s.find("```") {
        // Fenced block in the middle of chatter.
        let body = &s[start + 3..];
        let body = body.strip_prefix("json").unwrap_or(body);
        match body.find("```") {
            Some(end) => body[..end].trim().to_string(),
            None => body.trim().to_string(),
        }
    } else {
        s.to_string()
    }
}

fn preview(raw: &str) -> String {
    let head: String = raw.chars().take(200).collect();
    if raw.chars().count() > 200 {
        format!("{}...", head)
    } else {
        head
    }
}

// --- Text cleanup ---

static MARKDOWN_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    // Longest markers first so `***x***` never leaves a stray `*`.
    [
        r"\*\*\*(.+?)\*\*\*",
        r"___(.+?)___",
        r"\*\*(.+?)\*\*",
        r"__(.+?)__",
        r"\*([^*\s][^*]*?)\*",
        r"\b_([^_\s][^_]*?)_\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("markdown pattern"))
    .collect()
});

static HEADING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^[ \t]{0,3}#{1,6}[ \t]+").expect("heading pattern"));

/// Normalizes a free-text field from a model. Never fails; worst case returns the trimmed input.
pub fn clean_text(s: &str) -> String {
    let mut text = HEADING.replace_all(s, "").to_string();
    for pattern in MARKDOWN_PATTERNS.iter() {
        text = pattern.replace_all(&text, "$1").to_string();
    }

    let text: String = text
        .chars()
        .map(|c| match c {
            '\u{2018}' | '\u{2019}' => '\'',
            '\u{201C}' | '\u{201D}' => '"',
            _ => c,
        })
        .collect();

    let text = text
        .lines()
        .map(collapse_whitespace)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n");

    let unwrapped = if text.len() >= 2 && text.starts_with('"') && text.ends_with('"') {
        &text[1..text.len() - 1]
    } else {
        text.as_str()
    };
    unwrapped.trim().to_string()
}

// --- Merge ---

/// Combines the two generation passes into a book numbered `1..N` in text-record order.
///
/// Pages past `page_count` are dropped. A record with fewer usable pages than `page_count`
/// yields a shorter book with a warning; missing pages are never padded. Only an empty
/// book is an error.
pub fn merge(
    text: TextOnlyRecord,
    prompts: PromptSheetRecord,
    page_count: usize,
) -> Result<StoryBook> {
    let limit = if page_count == 0 { usize::MAX } else { page_count };

    let mut by_number: HashMap<i64, String> = HashMap::new();
    for (position, entry) in prompts.prompts.into_iter().enumerate() {
        let number = entry.page_number.unwrap_or(position as i64 + 1);
        let prompt = clean_text(&entry.image_prompt);
        if !prompt.is_empty() {
            by_number.entry(number).or_insert(prompt);
        }
    }

    let mut pages = Vec::new();
    for (position, page) in text.pages.into_iter().enumerate() {
        if pages.len() == limit {
            break;
        }
        let body = clean_text(&page.text);
        if body.is_empty() {
            continue;
        }

        let source_number = page.page_number.unwrap_or(position as i64 + 1);
        let page_number = pages.len() + 1;
        let image_prompt = match by_number.get(&source_number) {
            Some(prompt) => prompt.clone(),
            None => {
                warn!(
                    "No illustration prompt for source page {}, using fallback",
                    source_number
                );
                FALLBACK_PROMPT.to_string()
            }
        };

        pages.push(StoryPage {
            page_number,
            text: body,
            image_prompt,
        });
    }

    if pages.is_empty() {
        return Err(GenerationError::ContentRejected.into());
    }
    if page_count > 0 && pages.len() < page_count {
        warn!(
            "Story backend returned {} usable pages, {} requested",
            pages.len(),
            page_count
        );
    }

    let title = clean_text(&text.title);
    Ok(StoryBook {
        title: if title.is_empty() {
            "Untitled Story".to_string()
        } else {
            title
        },
        author_line: clean_text(&text.author_line),
        moral: clean_text(&text.moral),
        character_descriptions: text
            .character_descriptions
            .map(|d| clean_text(&d))
            .unwrap_or_default(),
        pages,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_code_blocks() {
        assert_eq!(strip_code_blocks("json"), "json");
        assert_eq!(strip_code_blocks("```json\n{}\n```"), "{}");
        assert_eq!(strip_code_blocks("```\n{}\n```"), "{}");
        assert_eq!(strip_code_blocks("  ```json  \n  {}  \n  ```  "), "{}");
        assert_eq!(
            strip_code_blocks("Here you go:\n```json\n{\"a\":1}\n```\nEnjoy!"),
            "{\"a\":1}"
        );
    }

    #[test]
    fn test_repair_truncated_array() {
        let repaired = repair_json(r#"{"a":1,"b":[1,2,"#);
        assert_eq!(repaired, r#"{"a":1,"b":[1,2]}"#);
        let value: Value = serde_json::from_str(&repaired).unwrap();
        assert_eq!(value["b"][1], 2);
    }

    #[test]
    fn test_repair_closes_innermost_first() {
        let repaired = repair_json(r#"{"pages":[{"pageNumber":1,"text":"Luna woke up"#);
        assert_eq!(repaired, r#"{"pages":[{"pageNumber":1,"text":"Luna woke up"}]}"#);
        assert!(serde_json::from_str::<Value>(&repaired).is_ok());
    }

    #[test]
    fn test_repair_ignores_brackets_inside_strings() {
        let repaired = repair_json(r#"{"text":"a {curly} [note], ok","list":[1"#);
        assert_eq!(repaired, r#"{"text":"a {curly} [note], ok","list":[1]}"#);
    }

    #[test]
    fn test_repair_escaped_quote_and_dangling_backslash() {
        let repaired = repair_json(r#"{"text":"she said \"hi\" and \"#);
        assert!(serde_json::from_str::<Value>(&repaired).is_ok());
    }

    #[test]
    fn test_repair_many_missing_closers() {
        let full = r#"{"a":{"b":[{"c":[1,{"d":2}]}]}}"#;
        for cut in 1..=6 {
            let truncated = &full[..full.len() - cut];
            let repaired = repair_json(truncated);
            assert_eq!(repaired, full, "cut {}", cut);
        }
    }

    #[test]
    fn test_strip_trailing_commas() {
        assert_eq!(strip_trailing_commas(r#"{"a":[1,2,],}"#), r#"{"a":[1,2]}"#);
        assert_eq!(strip_trailing_commas(r#"{"a":"x, ]"}"#), r#"{"a":"x, ]"}"#);
    }

    #[test]
    fn test_decode_direct_and_extracted() {
        let direct: PromptSheetRecord =
            decode(r#"{"prompts":[{"pageNumber":1,"imagePrompt":"Luna in a meadow"}]}"#).unwrap();
        assert_eq!(direct.prompts[0].image_prompt, "Luna in a meadow");

        let chatty = "Sure! Here is the story:\n{\"prompts\":[{\"pageNumber\":\"2\",\"prompt\":\"x\"}]}\nHope it helps.";
        let extracted: PromptSheetRecord = decode(chatty).unwrap();
        assert_eq!(extracted.prompts[0].page_number, Some(2));
    }

    #[test]
    fn test_decode_truncated_with_preamble() {
        let raw = r#"Okay! {"title":"Luna's Walk","pages":[{"pageNumber":1,"text":"Luna woke."},{"pageNumber":2,"text":"She walked"#;
        let record: TextOnlyRecord = decode(raw).unwrap();
        assert_eq!(record.title, "Luna's Walk");
        assert_eq!(record.pages.len(), 2);
        assert_eq!(record.pages[1].text, "She walked");
    }

    #[test]
    fn test_decode_envelopes() {
        let story = r#"{"story":{"title":"T","pages":[{"pageNumber":1,"text":"a"}]}}"#;
        let record: TextOnlyRecord = decode(story).unwrap();
        assert_eq!(record.title, "T");

        let choices = r#"{"choices":[{"message":{"content":"```json\n{\"prompts\":[{\"pageNumber\":1,\"imagePrompt\":\"p\"}]}\n```"}}]}"#;
        let sheet: PromptSheetRecord = decode(choices).unwrap();
        assert_eq!(sheet.prompts[0].image_prompt, "p");

        let mixed = r#"{"choices":[{"message":{"content":[{"type":"text","text":"{\"prompts\":[{\"pageNumber\":1,"},"\"imagePrompt\":\"q\"}]}"]}}]}"#;
        let sheet: PromptSheetRecord = decode(mixed).unwrap();
        assert_eq!(sheet.prompts[0].image_prompt, "q");
    }

    #[test]
    fn test_decode_failure_is_unparsable() {
        let err = decode::<PromptSheetRecord>("I cannot help with that.").unwrap_err();
        assert!(matches!(
            GenerationError::of(&err),
            Some(GenerationError::UnparsableResponse(_))
        ));
    }

    #[test]
    fn test_lenient_character_sheet() {
        let raw = r#"{"title":"T","characterDescriptions":["Luna - small orange fox",{"name":"Pip","description":"tiny gray mouse"}],"pages":[]}"#;
        let record: TextOnlyRecord = decode(raw).unwrap();
        assert_eq!(
            record.character_descriptions.as_deref(),
            Some("Luna - small orange fox\nPip - tiny gray mouse")
        );
    }

    #[test]
    fn test_clean_text() {
        assert_eq!(clean_text("***Luna*** the **brave** *fox*"), "Luna the brave fox");
        assert_eq!(clean_text("## The Big Day"), "The Big Day");
        assert_eq!(clean_text("\u{201C}Hello\u{201D}"), "Hello");
        assert_eq!(clean_text("it\u{2019}s   a   test  "), "it's a test");
        assert_eq!(
            clean_text("Luna - fox\n\n   Pip  -  mouse  "),
            "Luna - fox\nPip - mouse"
        );
        assert_eq!(clean_text("snake_case_name stays"), "snake_case_name stays");
        assert_eq!(clean_text(""), "");
    }

    fn text_page(number: Option<i64>, text: &str) -> TextOnlyPage {
        TextOnlyPage {
            page_number: number,
            text: text.to_string(),
        }
    }

    fn prompt(number: i64, text: &str) -> PromptEntry {
        PromptEntry {
            page_number: Some(number),
            image_prompt: text.to_string(),
        }
    }

    #[test]
    fn test_merge_renumbers_sparse_duplicate_unordered() {
        let text = TextOnlyRecord {
            title: "**Luna's Walk**".to_string(),
            author_line: "by Ada".to_string(),
            moral: "Be kind".to_string(),
            character_descriptions: Some("Luna - small orange fox".to_string()),
            pages: vec![
                text_page(Some(7), "Seven"),
                text_page(Some(3), "Three"),
                text_page(Some(3), "Three again"),
                text_page(None, "Unnumbered"),
                text_page(Some(10), "Ten"),
            ],
        };
        let prompts = PromptSheetRecord {
            prompts: vec![prompt(3, "Prompt three"), prompt(7, "Prompt seven")],
        };

        let book = merge(text, prompts, 4).unwrap();
        assert_eq!(book.title, "Luna's Walk");
        assert_eq!(book.pages.len(), 4);
        let numbers: Vec<usize> = book.pages.iter().map(|p| p.page_number).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4]);
        assert_eq!(book.pages[0].image_prompt, "Prompt seven");
        assert_eq!(book.pages[1].image_prompt, "Prompt three");
        assert_eq!(book.pages[2].image_prompt, "Prompt three");
        assert_eq!(book.pages[3].image_prompt, FALLBACK_PROMPT);
    }

    #[test]
    fn test_merge_skips_empty_pages_and_rejects_empty_story() {
        let text = TextOnlyRecord {
            title: String::new(),
            author_line: String::new(),
            moral: String::new(),
            character_descriptions: None,
            pages: vec![text_page(Some(1), "   "), text_page(Some(2), "Real page")],
        };
        let book = merge(text, PromptSheetRecord { prompts: vec![] }, 1).unwrap();
        assert_eq!(book.title, "Untitled Story");
        assert_eq!(book.pages[0].text, "Real page");
        assert_eq!(book.pages[0].page_number, 1);

        let empty = TextOnlyRecord {
            title: "T".to_string(),
            author_line: String::new(),
            moral: String::new(),
            character_descriptions: None,
            pages: vec![text_page(Some(1), "")],
        };
        let err = merge(empty, PromptSheetRecord { prompts: vec![] }, 3).unwrap_err();
        assert_eq!(GenerationError::of(&err), Some(&GenerationError::ContentRejected));
    }

    #[test]
    fn test_merge_short_record_is_not_padded() {
        let text = TextOnlyRecord {
            title: "Luna's Nap".to_string(),
            author_line: String::new(),
            moral: String::new(),
            character_descriptions: None,
            pages: vec![text_page(Some(1), "Luna yawns"), text_page(Some(2), "Luna sleeps")],
        };
        let prompts = PromptSheetRecord {
            prompts: vec![prompt(1, "Fox yawning"), prompt(2, "Fox asleep")],
        };

        let book = merge(text, prompts, 4).unwrap();
        assert_eq!(book.pages.len(), 2);
        let numbers: Vec<usize> = book.pages.iter().map(|p| p.page_number).collect();
        assert_eq!(numbers, vec![1, 2]);
        assert_eq!(book.pages[1].image_prompt, "Fox asleep");
    }
}
