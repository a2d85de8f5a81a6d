use crate::models::RankedParagraph;

pub const BOOK_TITLE: &str = "Purpose and Profit";
pub const BOOK_AUTHOR: &str = "Dan Koe";

const BOOK_DESCRIPTION: &str = "Transform Your Relationship With Money & Discover Your Life's Work\n\
Money controls most people's lives, but it doesn't have to. Money is only superficial to the \
superficial. There is, in fact, a way to merge purpose and profit to create a life filled with \
work you don't want to escape from.";

/// Marker the rewrite prompt asks the model to return for off-topic queries.
pub const INVALID_QUERY: &str = "INVALID_QUERY";

/// Chat-template control tokens that must never reach the model from user
/// input or book text.
const CONTROL_TOKENS: &[&str] = &[
    "<|im_start|>",
    "<|im_end|>",
    "<|endoftext|>",
    "<|system|>",
    "<|user|>",
    "<|assistant|>",
    "<start_of_turn>",
    "<end_of_turn>",
];

/// Strip chat-template control tokens.
pub fn sanitize_for_prompt(text: &str) -> String {
    let mut out = text.to_string();
    for token in CONTROL_TOKENS {
        if out.contains(token) {
            out = out.replace(token, "");
        }
    }
    out
}

/// Prompt asking the model to answer `query` from the retrieved paragraphs only.
pub fn build_answer_prompt(query: &str, results: &[RankedParagraph]) -> String {
    let n = results.len();
    let query = sanitize_for_prompt(query);

    let mut prompt = format!(
        "You are an LLM tasked with answering questions on the book \"{BOOK_TITLE}\" by {BOOK_AUTHOR}.\n\n\
         This is how the author described the book:\n```\n{BOOK_DESCRIPTION}\n```\n\n\
         I'll give you the search query and the top {n} paragraphs from the book that are most \
         relevant to the user's search query. Your job is to use those {n} paragraphs to answer \
         the user's question as best as you can.\n\n\
         - Do not deviate from the given paragraphs.\n\
         - If you don't have an answer, say \"I don't know\".\n\
         - Keep your answer concise and information-dense.\n\n\
         Here is the user's search query:\n{query}\n\n\
         Here are the top {n} paragraphs from the book that are most relevant to the user's search query:\n"
    );

    if results.is_empty() {
        prompt.push_str("(No relevant paragraphs were found.)\n");
    }
    for hit in results {
        prompt.push_str(&format!(
            "\n[paragraph {} | relevance {:.4}]\n{}\n",
            hit.id,
            hit.score,
            sanitize_for_prompt(&hit.paragraph)
        ));
    }
    prompt
}

/// Prompt asking the model to sharpen `query` for retrieval, or reject it.
pub fn build_query_prompt(query: &str) -> String {
    let query = sanitize_for_prompt(query);
    format!(
        "Your task is to take the user's search query, and then rewrite it to be more specific and focused.\n\
         These search queries will run on the book \"{BOOK_TITLE}\" by {BOOK_AUTHOR}. It is a business \
         mindset, self-help book.\n\n\
         Here is the user's search query:\n{query}\n\n\
         1. If the query is not a genuine question related to this book, stop further processing and return \"{INVALID_QUERY}\".\n\
         2. If the query is a genuine question related to this book, rewrite it to be more specific and focused.\n\n\
         Note that this search query will be used to semantic-search across the entire book and retrieve \
         relevant paragraphs.\n\n\
         In your output, ONLY RETURN the rewritten query. Do not include any additional text.\n"
    )
}

/// Outcome of asking the model to rewrite a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rewrite {
    Query(String),
    Invalid,
}

/// Interpret the rewrite model's reply. An empty reply keeps `original`.
pub fn parse_rewritten_query(reply: &str, original: &str) -> Rewrite {
    let cleaned = reply
        .trim()
        .trim_matches('`')
        .trim()
        .trim_matches('"')
        .trim();

    if cleaned.contains(INVALID_QUERY) {
        return Rewrite::Invalid;
    }
    if cleaned.is_empty() {
        return Rewrite::Query(original.to_string());
    }
    Rewrite::Query(cleaned.to_string())
}
