//! Prompt construction for the pipeline's LLM calls.
//!
//! Prompts are plain functions over the data they need; the workflow never
//! assembles prompt text inline.

/// How much page content the classifier sees.
pub const CLASSIFY_CONTENT_CHARS: usize = 2000;

pub const CLASSIFY_SYSTEM_PROMPT: &str = "\
You classify web pages for a personal knowledge base. \
Categories: knowledge (documentation, articles, reference material), \
interactive_app (web applications), aggregator (link feeds, frontpages), \
leisure (entertainment, social), navigation (search results, redirects), \
other. \
Respond with a single JSON object: \
{\"page_type\": string, \"confidence\": number between 0 and 1, \
\"reasoning\": string of at most 10 words, \"should_process\": boolean}. \
should_process is true only when the page carries durable knowledge worth keeping.";

pub fn classification_prompt(url: &str, content: &str) -> String {
    let window: String = content.chars().take(CLASSIFY_CONTENT_CHARS).collect();
    format!("URL: {}\n\nPage content:\n{}", url, window)
}

/// Same prompt with a caller-chosen window, used for the halved retry after
/// a transient failure.
pub fn classification_prompt_windowed(url: &str, content: &str, window_chars: usize) -> String {
    let window: String = content.chars().take(window_chars).collect();
    format!("URL: {}\n\nPage content:\n{}", url, window)
}

pub const EXTRACT_SYSTEM_PROMPT: &str = "\
You convert raw HTML into clean markdown for archival. \
Strip navigation chrome, advertisements, cookie notices, and boilerplate. \
Preserve headings, paragraphs, code blocks, and inline images by URL. \
Return only the markdown, no commentary.";

pub fn extraction_prompt(html: &str) -> String {
    format!("Convert this page to clean markdown:\n\n{}", html)
}

pub const ANALYSIS_SYSTEM_PROMPT: &str = "\
You analyse an archived web page. \
Respond with a single JSON object: \
{\"title\": string, \"summary\": string of at most 50 words, \
\"intentions\": array of short strings describing what the reader was likely trying to do}.";

pub fn analysis_prompt(url: &str, markdown: &str) -> String {
    format!("URL: {}\n\nPage markdown:\n{}", url, markdown)
}

pub const TREE_INTENTIONS_SYSTEM_PROMPT: &str = "\
You are given a browsing session: pages visited in order, with titles and summaries. \
Infer what the user was trying to accomplish across the whole session, then assign \
each page its intentions in that collective context. \
Respond with a single JSON object mapping each page's index (as a string) to an \
array of short intention strings, e.g. {\"0\": [\"compare async runtimes\"]}.";

/// Sequence view of a tree: pages indexed in load-time order.
pub fn tree_intentions_prompt(pages: &[(String, String, String)]) -> String {
    let mut out = String::from("Browsing session, in order:\n\n");
    for (index, (url, title, summary)) in pages.iter().enumerate() {
        out.push_str(&format!(
            "[{}] {}\n    URL: {}\n    Summary: {}\n\n",
            index, title, url, summary
        ));
    }
    out
}
