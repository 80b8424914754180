use ragdb_core::config::{EncoderBackend, EncoderConfig};
use ragdb_core::error::Error;
use ragdb_core::traits::Encoder;
use ragdb_embed::{build_encoder, AnalyzerEncoder, FakeEncoder};

fn norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

#[test]
fn fake_encoder_shapes_and_determinism() {
    let encoder = FakeEncoder::new(64, 128);
    let v1 = encoder.embed_dense("hello world").unwrap();
    let v2 = encoder.embed_dense("hello world").unwrap();
    assert_eq!(v1.len(), 64);
    assert!((norm(&v1) - 1.0).abs() <= 1e-3, "vector is L2-normalized");
    assert_eq!(v1, v2);

    let sparse = encoder.embed_sparse("Hello, hello world").unwrap();
    assert_eq!(sparse.get("hello"), Some(&2.0));
}

#[test]
fn analyzer_encoder_shares_terms_between_representations() {
    let encoder = AnalyzerEncoder::new(128, 128);
    let a = encoder.embed_dense("starting a campfire with dry tinder").unwrap();
    let b = encoder.embed_dense("dry tinder starts the campfire").unwrap();
    let c = encoder.embed_dense("purify water by boiling").unwrap();
    let sim = |x: &[f32], y: &[f32]| x.iter().zip(y).map(|(p, q)| p * q).sum::<f32>();
    assert!(sim(&a, &b) > sim(&a, &c));

    let sparse = encoder.embed_sparse("The tinder and the kindling").unwrap();
    assert!(!sparse.contains_key("the"));
    assert_eq!(sparse.len(), 2);
}

#[test]
fn stop_word_text_still_has_a_dense_vector() {
    let encoder = AnalyzerEncoder::new(32, 16);
    let v = encoder.embed_dense("the and of").unwrap();
    assert!((norm(&v) - 1.0).abs() < 1e-3);
    assert!(encoder.embed_sparse("the and of").unwrap().is_empty());
}

#[test]
fn rejects_empty_and_oversized_text() {
    let encoder = AnalyzerEncoder::new(32, 3);
    for text in ["", "   \n", "one two three four"] {
        assert!(matches!(encoder.embed_dense(text), Err(Error::Encoding(_))), "{text:?}");
        assert!(matches!(encoder.embed_sparse(text), Err(Error::Encoding(_))), "{text:?}");
    }
}

#[test]
fn backend_follows_configuration() {
    let cfg = EncoderConfig { backend: EncoderBackend::Fake, dim: 8, max_tokens: 10, model_dir: None };
    let encoder = build_encoder(&cfg).unwrap();
    assert_eq!(encoder.name(), "fake");
    assert_eq!(encoder.dim(), 8);

    let cfg = EncoderConfig { backend: EncoderBackend::Analyzer, ..cfg };
    assert_eq!(build_encoder(&cfg).unwrap().name(), "analyzer");
}

#[cfg(not(feature = "model"))]
#[test]
fn model_backend_requires_feature() {
    let cfg = EncoderConfig { backend: EncoderBackend::Model, ..EncoderConfig::default() };
    assert!(matches!(build_encoder(&cfg), Err(Error::InvalidConfig(_))));
}
