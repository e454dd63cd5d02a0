//! Scripted LLM and page fixtures.

mod llm;

pub use llm::MockLlm;

/// A minimal HTML page with a title heading and filler prose.
pub fn html_page(title: &str, words: usize) -> String {
    let body: Vec<String> = (0..words).map(|i| format!("word{}", i)).collect();
    format!(
        "<html><head><title>{}</title></head><body><h1>{}</h1><p>{}</p></body></html>",
        title,
        title,
        body.join(" ")
    )
}
