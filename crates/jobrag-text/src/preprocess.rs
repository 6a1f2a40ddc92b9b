//! Query preprocessing: keyword extraction, intent classification, bounded expansion.

use regex::Regex;
use serde::Serialize;

use jobrag_core::{Error, Result};

use crate::analyzer::Analyzer;

const CUE_PATTERN: &str = r"(?i)\b(methods?|approach(?:es)?|models?|algorithms?|techniques?|frameworks?|systems?|networks?|datasets?|metrics?)\b";
const ACRONYM_PATTERN: &str = r"\b[A-Z][A-Z0-9]{1,}s?\b";

const INTENT_PATTERNS: &[(QueryIntent, &str)] = &[
	(QueryIntent::Comparison, r"\b(compare|contrast|difference|differences|versus|vs|across|between)\b"),
	(QueryIntent::Methodology, r"\b(method|methods|approach|technique|techniques|algorithm|implementation|how)\b"),
	(QueryIntent::Gap, r"\b(gap|gaps|limitation|limitations|challenge|challenges|problem|issue|future work|missing)\b"),
	(QueryIntent::Result, r"\b(result|results|finding|findings|outcome|performance|accuracy|metric|metrics)\b"),
	(QueryIntent::Summary, r"\b(summarize|summary|overview|main|key|important)\b"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryIntent {
	Comparison,
	Methodology,
	Gap,
	Result,
	Summary,
	General,
}

impl QueryIntent {
	fn templates(self) -> &'static [&'static str] {
		match self {
			Self::Methodology => &["describe the approach and techniques used: ", "implementation details and methods: "],
			Self::Gap => &["limitations and future work: ", "challenges and open problems: "],
			Self::Comparison => &["similarities and differences: "],
			Self::Result | Self::Summary | Self::General => &[],
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreprocessedQuery {
	pub text: String,
	/// Analyzer terms with salient terms repeated once for emphasis.
	pub keywords: Vec<String>,
	pub salient: Vec<String>,
	pub intents: Vec<QueryIntent>,
	/// Original question first; never longer than the expansion limit.
	pub phrasings: Vec<String>,
	/// Keyword sets for `phrasings[1..]`.
	pub alternates: Vec<Vec<String>>,
}

pub struct QueryPreprocessor {
	analyzer: Analyzer,
	expansion_limit: usize,
	cue: Regex,
	acronym: Regex,
	intents: Vec<(QueryIntent, Regex)>,
}

impl QueryPreprocessor {
	pub fn new(analyzer: Analyzer, expansion_limit: usize) -> Result<Self> {
		let compile = |p: &str| Regex::new(p).map_err(|e| Error::InvalidConfig(format!("bad pattern {p}: {e}")));
		let intents = INTENT_PATTERNS
			.iter()
			.map(|(intent, p)| compile(p).map(|re| (*intent, re)))
			.collect::<Result<Vec<_>>>()?;
		Ok(Self {
			analyzer,
			expansion_limit: expansion_limit.max(1),
			cue: compile(CUE_PATTERN)?,
			acronym: compile(ACRONYM_PATTERN)?,
			intents,
		})
	}

	pub fn analyzer(&self) -> &Analyzer { &self.analyzer }

	/// Stop-word-free terms of `text`, in order, without duplicates.
	pub fn extract_keywords(&self, text: &str) -> Vec<String> {
		let mut seen = std::collections::HashSet::new();
		self.analyzer.tokenize(text).into_iter().filter(|t| seen.insert(t.clone())).collect()
	}

	/// Domain cue words and acronyms, lowercased, in order of appearance.
	pub fn salient_terms(&self, text: &str) -> Vec<String> {
		let mut found: Vec<(usize, String)> = self
			.cue
			.find_iter(text)
			.chain(self.acronym.find_iter(text))
			.flat_map(|m| self.analyzer.tokenize(m.as_str()).into_iter().map(move |t| (m.start(), t)))
			.collect();
		found.sort_by_key(|(pos, _)| *pos);
		let mut seen = std::collections::HashSet::new();
		found.into_iter().map(|(_, t)| t).filter(|t| seen.insert(t.clone())).collect()
	}

	pub fn classify(&self, text: &str) -> Vec<QueryIntent> {
		let lower = text.to_lowercase();
		let intents: Vec<QueryIntent> = self.intents.iter().filter(|(_, re)| re.is_match(&lower)).map(|(i, _)| *i).collect();
		if intents.is_empty() { vec![QueryIntent::General] } else { intents }
	}

	/// The question itself plus intent-driven rephrasings, capped at the expansion limit.
	pub fn expand(&self, text: &str) -> Vec<String> {
		let text = text.trim();
		let mut phrasings = vec![text.to_string()];
		for intent in self.classify(text) {
			for prefix in intent.templates() {
				phrasings.push(format!("{prefix}{text}"));
			}
		}
		phrasings.truncate(self.expansion_limit);
		phrasings
	}

	pub fn preprocess(&self, text: &str, expand: bool) -> PreprocessedQuery {
		let salient = self.salient_terms(text);
		let mut keywords = self.extract_keywords(text);
		let boost: Vec<String> = salient.iter().filter(|s| keywords.contains(s)).cloned().collect();
		keywords.extend(boost);
		let phrasings = if expand { self.expand(text) } else { vec![text.trim().to_string()] };
		let alternates = phrasings.iter().skip(1).map(|p| self.extract_keywords(p)).collect();
		PreprocessedQuery { text: text.trim().to_string(), keywords, salient, intents: self.classify(text), phrasings, alternates }
	}
}
