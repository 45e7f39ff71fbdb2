/// Natural-language answers
///
/// The model phrases the answer; when it cannot, a deterministic summary of
/// the rows is returned in the question's language.

use regex::Regex;
use serde_json::Value;

use super::prompts::{build_response_prompt, RESPONSE_SYSTEM_PROMPT};
use crate::llm::{LlmProvider, LlmRequest};
use crate::sql::QueryResult;

/// Rows listed in the fallback answer.
const FALLBACK_ROW_LIMIT: usize = 5;

/// True when the text carries Vietnamese-specific letters.
pub fn looks_vietnamese(text: &str) -> bool {
    Regex::new(r"[ăâđêôơưĂÂĐÊÔƠƯàảãáạằẳẵắặầẩẫấậèẻẽéẹềểễếệìỉĩíịòỏõóọồổỗốộờởỡớợùủũúụừửữứựỳỷỹýỵ]")
        .map(|re| re.is_match(text))
        .unwrap_or(false)
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "-".to_string(),
        other => other.to_string(),
    }
}

fn render_row(row: &Value) -> String {
    match row {
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| format!("{}: {}", k, render_value(v)))
            .collect::<Vec<_>>()
            .join(", "),
        other => render_value(other),
    }
}

/// Row summary used when the response model is unavailable.
pub fn fallback_answer(question: &str, result: &QueryResult) -> String {
    let vietnamese = looks_vietnamese(question);

    if result.row_count == 0 {
        return if vietnamese {
            "Không tìm thấy dữ liệu phù hợp với câu hỏi của bạn.".to_string()
        } else {
            "No matching data was found for your question.".to_string()
        };
    }

    // A single scalar reads better without the column name
    if result.row_count == 1 && result.columns.len() == 1 {
        let value = result.rows[0]
            .get(&result.columns[0])
            .map(render_value)
            .unwrap_or_default();
        return if vietnamese {
            format!("Kết quả: {}.", value)
        } else {
            format!("Result: {}.", value)
        };
    }

    let mut out = if vietnamese {
        format!("Tìm thấy {} kết quả", result.row_count)
    } else {
        format!("Found {} rows", result.row_count)
    };
    if result.truncated {
        out.push_str(if vietnamese { " (đã giới hạn)" } else { " (limited)" });
    }
    out.push_str(":\n");
    for row in result.rows.iter().take(FALLBACK_ROW_LIMIT) {
        out.push_str(&format!("- {}\n", render_row(row)));
    }
    if result.row_count > FALLBACK_ROW_LIMIT {
        let rest = result.row_count - FALLBACK_ROW_LIMIT;
        out.push_str(&if vietnamese {
            format!("... và {} dòng khác.", rest)
        } else {
            format!("... and {} more.", rest)
        });
    }
    out.trim_end().to_string()
}

/// Phrase the answer. Returns the text and whether the fallback was used.
pub async fn compose_answer(
    llm: &dyn LlmProvider,
    question: &str,
    sql: &str,
    result: &QueryResult,
) -> (String, bool) {
    let request = LlmRequest::text(RESPONSE_SYSTEM_PROMPT, build_response_prompt(question, sql, result));
    match llm.complete(&request).await {
        Ok(text) if !text.trim().is_empty() => (text.trim().to_string(), false),
        Ok(_) => {
            tracing::warn!("Response model returned empty text, using fallback answer");
            (fallback_answer(question, result), true)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Response generation failed, using fallback answer");
            (fallback_answer(question, result), true)
        }
    }
}

/// Answer persisted when no SQL could be produced or run.
pub fn failure_answer(question: &str) -> String {
    if looks_vietnamese(question) {
        "Xin lỗi, tôi chưa thể trả lời câu hỏi này từ dữ liệu hiện có. Bạn có thể diễn đạt lại cụ thể hơn không?"
            .to_string()
    } else {
        "Sorry, I could not answer that from the available data. Could you rephrase it more specifically?"
            .to_string()
    }
}

/// Reply for chitchat or out-of-scope messages when the model gave none.
pub fn default_direct_reply(question: &str, out_of_scope: bool) -> String {
    match (looks_vietnamese(question), out_of_scope) {
        (true, true) => "Tôi chỉ có thể trả lời các câu hỏi về dữ liệu phòng trọ, hợp đồng, hóa đơn và thanh toán.".to_string(),
        (true, false) => "Xin chào! Bạn muốn tra cứu thông tin gì về phòng, hợp đồng hay hóa đơn?".to_string(),
        (false, true) => "I can only answer questions about rooms, contracts, bills and payments.".to_string(),
        (false, false) => "Hello! What would you like to know about rooms, contracts or bills?".to_string(),
    }
}
