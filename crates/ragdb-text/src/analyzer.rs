//! Term analysis shared by ingestion and query encoding.
//!
//! Lower-cased simple tokens, English stop words removed, Porter stemmed.
use tantivy::tokenizer::{Language, LowerCaser, RemoveLongFilter, SimpleTokenizer, Stemmer, StopWordFilter, TextAnalyzer, TokenStream};

use ragdb_core::types::SparseTerms;

const STOP_WORDS: &[&str] = &[
	"a","an","and","are","as","at","be","by","for","from","has","he","in","is","it","its","of","on","that","the","to","was","will","with","or","but","not","this","these","they","them","their","there","then","than","so","if","when","where","why","how","what","which","who","whom","whose","can","could","should","would","may","might","must","shall","do","does","did","have","had","having",
];

#[derive(Clone)]
pub struct Analyzer {
	inner: TextAnalyzer,
}

impl Default for Analyzer {
	fn default() -> Self {
		Self::english()
	}
}

impl Analyzer {
	pub fn english() -> Self {
		let inner = TextAnalyzer::builder(SimpleTokenizer::default())
			.filter(RemoveLongFilter::limit(40))
			.filter(LowerCaser)
			.filter(StopWordFilter::remove(STOP_WORDS.iter().map(|s| s.to_string())))
			.filter(Stemmer::new(Language::English))
			.build();
		Self { inner }
	}

	pub fn terms(&self, text: &str) -> Vec<String> {
		// token_stream needs a mutable analyzer; clones are cheap.
		let mut analyzer = self.inner.clone();
		let mut stream = analyzer.token_stream(text);
		let mut out = Vec::new();
		while stream.advance() {
			out.push(stream.token().text.clone());
		}
		out
	}

	/// Term frequencies, the sparse representation of `text`.
	pub fn term_frequencies(&self, text: &str) -> SparseTerms {
		let mut tf = SparseTerms::new();
		for term in self.terms(text) {
			*tf.entry(term).or_insert(0.0) += 1.0;
		}
		tf
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn drops_stop_words_and_stems() {
		let terms = Analyzer::english().terms("The Installers are installing the packages");
		assert_eq!(terms.len(), 3);
		assert_eq!(terms[0], terms[1]);
		assert!(terms[2].starts_with("packag"));
	}

	#[test]
	fn counts_term_frequencies() {
		let tf = Analyzer::english().term_frequencies("fire fire water");
		assert_eq!(tf.get("fire"), Some(&2.0));
		assert_eq!(tf.get("water"), Some(&1.0));
		assert!(Analyzer::english().term_frequencies("the and of").is_empty());
	}
}
