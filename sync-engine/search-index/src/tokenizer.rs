use deunicode::deunicode_char;
use tantivy::tokenizer::{BoxTokenStream, SimpleTokenizer, Token, TokenStream, Tokenizer};

/// The name the analyzer is registered under for every text field.
pub static UNICODE_TOKENIZER: &str = "unicode";

/// Transliterates text into lower-cased ascii before splitting it
/// into words.
#[derive(Clone, Default)]
pub struct SimpleUnicodeTokenizer;

pub fn produce_tokens(text: &str) -> Vec<Token> {
    let mut characters = String::with_capacity(text.len());
    for char in text.chars() {
        if let Some(ascii) = deunicode_char(char) {
            if ascii.len() > 1 {
                characters.push(' ');
            }
            characters.extend(ascii.to_lowercase().chars())
        }
    }

    let mut stream = SimpleTokenizer {}.token_stream(&characters);

    let mut tokens = vec![];
    while stream.advance() {
        tokens.push(stream.token().clone());
    }

    tokens
}

/// The analyzed terms of the given text in order of appearance.
pub fn produce_terms(text: &str) -> Vec<String> {
    produce_tokens(text).into_iter().map(|t| t.text).collect()
}

pub struct SimpleTokenStream {
    tokens: Vec<Token>,
    pointer: usize,
}

impl Tokenizer for SimpleUnicodeTokenizer {
    fn token_stream<'a>(&self, text: &'a str) -> BoxTokenStream<'a> {
        let tokens = produce_tokens(text);

        BoxTokenStream::from(SimpleTokenStream { tokens, pointer: 0 })
    }
}

impl TokenStream for SimpleTokenStream {
    fn advance(&mut self) -> bool {
        if self.pointer < self.tokens.len() {
            self.pointer += 1;
            true
        } else {
            false
        }
    }

    fn token(&self) -> &Token {
        &self.tokens[self.pointer - 1]
    }

    fn token_mut(&mut self) -> &mut Token {
        &mut self.tokens[self.pointer - 1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transliterates_and_lowercases() {
        let terms = produce_terms("Crème Brûlée FOR Ünïcode");
        assert_eq!(terms, vec!["creme", "brulee", "for", "unicode"]);
    }

    #[test]
    fn stream_yields_every_token() {
        let mut stream = SimpleUnicodeTokenizer.token_stream("hello big world");
        let mut seen = vec![];
        while stream.advance() {
            seen.push(stream.token().text.clone());
        }

        assert_eq!(seen, vec!["hello", "big", "world"]);
    }
}
