use tantivy::tokenizer::{LowerCaser, RemoveLongFilter, SimpleTokenizer, StopWordFilter, TextAnalyzer, TokenStream};

/// Tokens shorter than this carry too little signal to index.
pub const MIN_TOKEN_LEN: usize = 3;

pub const STOP_WORDS: &[&str] = &[
	"a","an","and","are","as","at","be","by","for","from","has","he","in","is","it","its","of","on","that","the","to","was","will","with","or","but","not","this","these","they","them","their","there","then","than","so","if","when","where","why","how","what","which","who","whom","whose","can","could","should","would","may","might","must","shall","do","does","did","have","had","having",
	"about","also","any","been","both","each","into","more","most","other","our","some","such","were","you","your",
];

/// Shared tokenizer: simple split, lowercase, stop-word removal, min length.
///
/// Chunk tokens and query terms both come from here, so they always agree.
#[derive(Clone)]
pub struct Analyzer {
	inner: TextAnalyzer,
}

impl Default for Analyzer {
	fn default() -> Self { Self::new() }
}

impl Analyzer {
	pub fn new() -> Self {
		let inner = TextAnalyzer::builder(SimpleTokenizer::default())
			.filter(RemoveLongFilter::limit(40))
			.filter(LowerCaser)
			.filter(StopWordFilter::remove(STOP_WORDS.iter().map(|s| s.to_string())))
			.build();
		Self { inner }
	}

	pub fn tokenize(&self, text: &str) -> Vec<String> {
		let mut analyzer = self.inner.clone();
		let mut stream = analyzer.token_stream(text);
		let mut tokens = Vec::new();
		while stream.advance() {
			let token = &stream.token().text;
			if token.chars().count() >= MIN_TOKEN_LEN { tokens.push(token.clone()); }
		}
		tokens
	}

	pub fn is_stop_word(word: &str) -> bool { STOP_WORDS.contains(&word) }
}
