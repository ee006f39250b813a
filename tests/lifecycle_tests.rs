//! Engine lifecycle and generation tests against the scripted backend.

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;

use mandre_bridge::inference::backend::KvCacheType;
use mandre_bridge::inference::mock::{MockBackend, MockScript};
use mandre_bridge::inference::model_loader::header_bytes;
use mandre_bridge::{BridgeError, CancelToken, Engine, StopReason};
use tempfile::TempDir;

struct Fixture {
    dir: TempDir,
    model: PathBuf,
    mmproj: PathBuf,
    image: PathBuf,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let model = dir.path().join("model.gguf");
    let mmproj = dir.path().join("mmproj.gguf");
    let image = dir.path().join("photo.png");
    std::fs::write(&model, header_bytes(3, 291, 24)).unwrap();
    std::fs::write(&mmproj, header_bytes(3, 12, 8)).unwrap();
    std::fs::write(&image, b"\x89PNG").unwrap();
    Fixture {
        dir,
        model,
        mmproj,
        image,
    }
}

fn generate(engine: &mut Engine<MockBackend>, prompt: &str, image: Option<&Path>) -> (Vec<String>, StopReason) {
    let mut pieces = Vec::new();
    let summary = engine
        .infer(prompt, image, |p| pieces.push(p.to_string()))
        .unwrap();
    (pieces, summary.stop_reason)
}

#[test]
fn test_configure_applies_only_recognized_keys() {
    let mut engine = Engine::new(MockBackend::default());
    engine
        .configure(r#"{"n_threads": 8, "n_ctx": 4096, "flash_attn": true}"#)
        .unwrap();
    assert_eq!(engine.config().n_threads, 8);
    assert_eq!(engine.config().n_ctx, 4096);
    assert_eq!(engine.config().n_batch, 512);
    assert_eq!(engine.config().img_max_tokens, 128);
}

#[test]
fn test_invalid_config_keeps_prior_state() {
    let mut engine = Engine::new(MockBackend::default());
    engine.configure(r#"{"n_batch": 256}"#).unwrap();
    let before = engine.config().clone();

    let err = engine.configure(r#"{"n_threads": 2, "n_ctx": "#).unwrap_err();
    assert!(matches!(err, BridgeError::ConfigParse(_)));
    assert_eq!(err.status_code(), -1);

    let err = engine.configure(r#"{"n_threads": 2, "n_ctx": "big"}"#).unwrap_err();
    assert!(matches!(err, BridgeError::ConfigParse(_)));
    assert_eq!(engine.config(), &before);
}

#[test]
fn test_load_uses_configured_context() {
    let fx = fixture();
    let backend = MockBackend::new(MockScript::with_pieces(["a"]));
    let stats = backend.stats();
    let mut engine = Engine::new(backend);
    engine
        .configure(r#"{"n_threads": 6, "n_ctx": 1024, "n_batch": 128}"#)
        .unwrap();
    engine.load_model(&fx.model).unwrap();

    let params = stats.last_context_params.lock().unwrap().clone().unwrap();
    assert_eq!(params.n_ctx, 1024);
    assert_eq!(params.n_batch, 128);
    assert_eq!(params.n_ubatch, 64);
    assert_eq!(params.n_threads, 6);
    assert_eq!(params.n_threads_batch, 6);
    assert_eq!(params.type_k, KvCacheType::Q8_0);
    assert_eq!(params.type_v, KvCacheType::Q8_0);

    let model_params = stats.last_model_params.lock().unwrap().clone().unwrap();
    assert!(model_params.use_mmap);
    assert!(engine.is_ready());
}

#[test]
fn test_kv_quant_off_uses_f16() {
    let fx = fixture();
    let backend = MockBackend::default();
    let stats = backend.stats();
    let mut engine = Engine::new(backend);
    engine.configure(r#"{"kv_quant": false}"#).unwrap();
    engine.load_model(&fx.model).unwrap();

    let params = stats.last_context_params.lock().unwrap().clone().unwrap();
    assert_eq!(params.type_k, KvCacheType::F16);
}

#[test]
fn test_fixed_seed_reaches_sampler() {
    let fx = fixture();
    let backend = MockBackend::default();
    let stats = backend.stats();
    let mut config = mandre_bridge::EngineConfig::default();
    config.sampler.seed = Some(1234);

    let mut engine = Engine::new(backend);
    engine.set_config(config);
    engine.load_model(&fx.model).unwrap();
    assert_eq!(*stats.last_seed.lock().unwrap(), Some(1234));
}

#[test]
fn test_model_load_failures() {
    let fx = fixture();

    let mut engine = Engine::new(MockBackend::default());
    let err = engine.load_model(&fx.dir.path().join("missing.gguf")).unwrap_err();
    assert_eq!(err.status_code(), -1);

    let bogus = fx.dir.path().join("bogus.gguf");
    std::fs::write(&bogus, b"not a model at all, just text").unwrap();
    let err = engine.load_model(&bogus).unwrap_err();
    assert!(matches!(err, BridgeError::ModelLoad(_)));

    let backend = MockBackend::new(MockScript {
        fail_model_load: true,
        ..Default::default()
    });
    let stats = backend.stats();
    let mut engine = Engine::new(backend);
    let err = engine.load_model(&fx.model).unwrap_err();
    assert_eq!(err.status_code(), -1);
    assert_eq!(stats.models.load(Ordering::SeqCst), 0);
    assert!(!engine.is_model_loaded());
}

#[test]
fn test_context_failure_releases_model() {
    let fx = fixture();
    let backend = MockBackend::new(MockScript {
        fail_context: true,
        ..Default::default()
    });
    let stats = backend.stats();
    let mut engine = Engine::new(backend);

    let err = engine.load_model(&fx.model).unwrap_err();
    assert!(matches!(err, BridgeError::ContextCreate(_)));
    assert_eq!(err.status_code(), -2);
    assert_eq!(stats.models.load(Ordering::SeqCst), 0);
    assert!(!engine.is_model_loaded());

    engine.free();
    assert_eq!(stats.live_handles(), 0);
}

#[test]
fn test_model_then_projector() {
    let fx = fixture();
    let backend = MockBackend::default();
    let stats = backend.stats();
    let mut engine = Engine::new(backend);

    let err = engine.load_projector(&fx.mmproj).unwrap_err();
    assert!(matches!(err, BridgeError::ModelNotLoaded));
    assert_eq!(err.status_code(), -2);

    engine.load_model(&fx.model).unwrap();
    engine.load_projector(&fx.mmproj).unwrap();
    assert!(engine.has_projector());

    let params = stats.last_projector_params.lock().unwrap().clone().unwrap();
    assert!(!params.use_gpu);
    assert_eq!(params.image_min_tokens, 32);
    assert_eq!(params.image_max_tokens, 128);

    // Replacing keeps exactly one projector alive.
    engine.load_projector(&fx.mmproj).unwrap();
    assert_eq!(stats.projectors.load(Ordering::SeqCst), 1);
}

#[test]
fn test_projector_failures() {
    let fx = fixture();
    let backend = MockBackend::new(MockScript {
        fail_projector: true,
        ..Default::default()
    });
    let mut engine = Engine::new(backend);
    engine.load_model(&fx.model).unwrap();

    let err = engine.load_projector(&fx.mmproj).unwrap_err();
    assert!(matches!(err, BridgeError::ProjectorInit(_)));
    assert_eq!(err.status_code(), -1);
    assert!(!engine.has_projector());

    let err = engine.load_projector(&fx.dir.path().join("nope.gguf")).unwrap_err();
    assert_eq!(err.status_code(), -1);
}

#[test]
fn test_small_image_budget_lowers_minimum() {
    let fx = fixture();
    let backend = MockBackend::default();
    let stats = backend.stats();
    let mut engine = Engine::new(backend);
    engine.configure(r#"{"img_max_tokens": 16}"#).unwrap();
    engine.load_model(&fx.model).unwrap();
    engine.load_projector(&fx.mmproj).unwrap();

    let params = stats.last_projector_params.lock().unwrap().clone().unwrap();
    assert_eq!(params.image_min_tokens, 16);
    assert_eq!(params.image_max_tokens, 16);
}

#[test]
fn test_text_generation_streams_pieces() {
    let fx = fixture();
    let backend = MockBackend::new(MockScript::with_pieces(["The", " sky", " is", " blue."]));
    let stats = backend.stats();
    let mut engine = Engine::new(backend);
    engine.load_model(&fx.model).unwrap();

    let (pieces, stop) = generate(&mut engine, "what colour is the sky", None);
    assert_eq!(pieces.concat(), "The sky is blue.");
    assert_eq!(pieces.len(), 4);
    assert_eq!(stop, StopReason::EndOfGeneration);
    assert_eq!(engine.last_stop_reason(), Some(StopReason::EndOfGeneration));
    assert_eq!(stats.memory_clears.load(Ordering::SeqCst), 1);
    assert!(stats.last_multimodal_text.lock().unwrap().is_none());
}

#[test]
fn test_generation_can_run_twice() {
    let fx = fixture();
    let mut engine = Engine::new(MockBackend::new(MockScript::with_pieces(["ok"])));
    engine.load_model(&fx.model).unwrap();

    let (first, _) = generate(&mut engine, "one", None);
    let (second, _) = generate(&mut engine, "two", None);
    assert_eq!(first, second);
}

#[test]
fn test_split_characters_are_grouped() {
    let fx = fixture();
    let pieces: Vec<Vec<u8>> = vec![b"caf".to_vec(), vec![0xC3], vec![0xA9], b"!".to_vec()];
    let mut engine = Engine::new(MockBackend::new(MockScript::with_pieces(pieces)));
    engine.load_model(&fx.model).unwrap();

    let (out, _) = generate(&mut engine, "coffee", None);
    assert_eq!(out, vec!["caf", "é", "!"]);
}

#[test]
fn test_step_cap() {
    let fx = fixture();
    let mut engine = Engine::new(MockBackend::new(MockScript::with_pieces(["x"]).endless()));
    engine.load_model(&fx.model).unwrap();
    engine.set_max_tokens(5);

    let mut count = 0;
    let summary = engine.infer("go", None, |_| count += 1).unwrap();
    assert_eq!(count, 5);
    assert_eq!(summary.generated_tokens, 5);
    assert_eq!(summary.stop_reason, StopReason::MaxTokens);
}

#[test]
fn test_full_context_ends_with_decode_failure() {
    let fx = fixture();
    let mut engine = Engine::new(MockBackend::new(MockScript::with_pieces(["x"]).endless()));
    engine.configure(r#"{"n_ctx": 16}"#).unwrap();
    engine.load_model(&fx.model).unwrap();

    let (pieces, stop) = generate(&mut engine, "fill it", None);
    assert_eq!(stop, StopReason::DecodeFailed);
    assert!(pieces.len() < 16);
}

#[test]
fn test_scripted_decode_failure() {
    let fx = fixture();
    let backend = MockBackend::new(MockScript {
        fail_decode_at: Some(1),
        ..MockScript::with_pieces(["a", "b", "c"])
    });
    let mut engine = Engine::new(backend);
    engine.load_model(&fx.model).unwrap();

    let (pieces, stop) = generate(&mut engine, "hi", None);
    assert_eq!(pieces, vec!["a", "b"]);
    assert_eq!(stop, StopReason::DecodeFailed);
}

#[test]
fn test_infer_before_load() {
    let mut engine = Engine::new(MockBackend::default());
    let mut called = false;
    let err = engine.infer("hello", None, |_| called = true).unwrap_err();
    assert!(matches!(err, BridgeError::ContextNotReady));
    assert_eq!(err.status_code(), -1);
    assert!(!called);
}

#[test]
fn test_cancel_before_generation_yields_nothing() {
    let fx = fixture();
    let cancel = CancelToken::new();
    let backend = MockBackend::new(MockScript {
        cancel_on_prompt: Some(cancel.clone()),
        ..MockScript::with_pieces(["never"]).endless()
    });
    let mut engine = Engine::with_cancel_token(backend, cancel);
    engine.load_model(&fx.model).unwrap();

    let mut calls = 0;
    let summary = engine.infer("stop right away", None, |_| calls += 1).unwrap();
    assert_eq!(calls, 0);
    assert_eq!(summary.generated_tokens, 0);
    assert_eq!(summary.stop_reason, StopReason::Cancelled);
}

#[test]
fn test_cancel_mid_generation_stops_within_one_step() {
    let fx = fixture();
    let cancel = CancelToken::new();
    let backend = MockBackend::new(MockScript {
        cancel_at_step: Some((2, cancel.clone())),
        ..MockScript::with_pieces(["a", "b", "c", "d"]).endless()
    });
    let mut engine = Engine::with_cancel_token(backend, cancel);
    engine.load_model(&fx.model).unwrap();

    let (pieces, stop) = generate(&mut engine, "count", None);
    // The token sampled when the request arrived is still delivered.
    assert_eq!(pieces, vec!["a", "b", "c"]);
    assert_eq!(stop, StopReason::Cancelled);
}

#[test]
fn test_stale_cancel_is_discarded() {
    let fx = fixture();
    let mut engine = Engine::new(MockBackend::new(MockScript::with_pieces(["fresh"])));
    engine.load_model(&fx.model).unwrap();

    engine.cancel();
    let (pieces, stop) = generate(&mut engine, "start", None);
    assert_eq!(pieces, vec!["fresh"]);
    assert_eq!(stop, StopReason::EndOfGeneration);
}

#[test]
fn test_vision_prompt() {
    let fx = fixture();
    let backend = MockBackend::new(MockScript::with_pieces(["A", " cat."]));
    let stats = backend.stats();
    let mut engine = Engine::new(backend);
    engine.load_model(&fx.model).unwrap();
    engine.load_projector(&fx.mmproj).unwrap();

    let summary = engine
        .infer("describe this", Some(fx.image.as_path()), |_| {})
        .unwrap();
    assert_eq!(
        stats.last_multimodal_text.lock().unwrap().as_deref(),
        Some("<__media__>\ndescribe this")
    );
    // BOS + image capped at 128 + three words.
    assert_eq!(summary.prompt_tokens, 1 + 128 + 3);
    assert_eq!(stats.images.load(Ordering::SeqCst), 0);
}

#[test]
fn test_unreadable_image_falls_back_to_text() {
    let fx = fixture();
    let backend = MockBackend::new(MockScript::with_pieces(["text"]));
    let stats = backend.stats();
    let mut engine = Engine::new(backend);
    engine.load_model(&fx.model).unwrap();
    engine.load_projector(&fx.mmproj).unwrap();

    let missing = fx.dir.path().join("gone.png");
    let (pieces, _) = generate(&mut engine, "describe this", Some(missing.as_path()));
    assert_eq!(pieces, vec!["text"]);
    assert!(stats.last_multimodal_text.lock().unwrap().is_none());
}

#[test]
fn test_image_ignored_without_projector_or_path() {
    let fx = fixture();
    let backend = MockBackend::new(MockScript::with_pieces(["text"]));
    let stats = backend.stats();
    let mut engine = Engine::new(backend);
    engine.load_model(&fx.model).unwrap();

    let summary = engine.infer("look", Some(fx.image.as_path()), |_| {}).unwrap();
    assert_eq!(summary.prompt_tokens, 2);

    engine.load_projector(&fx.mmproj).unwrap();
    let summary = engine.infer("look", Some(Path::new("")), |_| {}).unwrap();
    assert_eq!(summary.prompt_tokens, 2);
    assert!(stats.last_multimodal_text.lock().unwrap().is_none());
}

#[test]
fn test_prompt_is_decoded_in_batches() {
    let fx = fixture();
    let backend = MockBackend::new(MockScript::with_pieces(["ok"]));
    let stats = backend.stats();
    let mut engine = Engine::new(backend);
    engine.configure(r#"{"n_batch": 4}"#).unwrap();
    engine.load_model(&fx.model).unwrap();

    let summary = engine
        .infer("one two three four five six seven eight nine ten", None, |_| {})
        .unwrap();
    assert_eq!(summary.prompt_tokens, 11);
    assert_eq!(stats.largest_decode.load(Ordering::SeqCst), 4);
    // Three prompt chunks plus one generated token.
    assert_eq!(stats.decode_calls.load(Ordering::SeqCst), 4);
}

#[test]
fn test_prompt_too_long() {
    let fx = fixture();
    let mut engine = Engine::new(MockBackend::new(MockScript::with_pieces(["x"])));
    engine.configure(r#"{"n_ctx": 8}"#).unwrap();
    engine.load_model(&fx.model).unwrap();

    let err = engine
        .infer("one two three four five six seven eight nine", None, |_| {})
        .unwrap_err();
    assert!(matches!(err, BridgeError::PromptTooLong { tokens: 10, n_ctx: 8 }));
    assert_eq!(err.status_code(), -4);
}

#[test]
fn test_free_never_loaded_engine() {
    let backend = MockBackend::default();
    let stats = backend.stats();
    let mut engine = Engine::new(backend);
    engine.free();
    engine.free();
    assert_eq!(stats.live_handles(), 0);
}

#[test]
fn test_repeated_load_free_cycles_leak_nothing() {
    let fx = fixture();
    let backend = MockBackend::new(MockScript::with_pieces(["hi"]));
    let stats = backend.stats();
    let mut engine = Engine::new(backend);

    for _ in 0..5 {
        engine.load_model(&fx.model).unwrap();
        engine.load_projector(&fx.mmproj).unwrap();
        generate(&mut engine, "hello", Some(fx.image.as_path()));
        assert_eq!(stats.live_handles(), 5);
        engine.free();
        assert_eq!(stats.live_handles(), 0);
    }
}

#[test]
fn test_reload_replaces_everything() {
    let fx = fixture();
    let backend = MockBackend::default();
    let stats = backend.stats();
    let mut engine = Engine::new(backend);

    engine.load_model(&fx.model).unwrap();
    engine.load_projector(&fx.mmproj).unwrap();
    engine.load_model(&fx.model).unwrap();

    assert!(!engine.has_projector());
    assert_eq!(stats.runtimes.load(Ordering::SeqCst), 1);
    assert_eq!(stats.models.load(Ordering::SeqCst), 1);
    assert_eq!(stats.contexts.load(Ordering::SeqCst), 1);
    assert_eq!(stats.samplers.load(Ordering::SeqCst), 1);

    drop(engine);
    assert_eq!(stats.live_handles(), 0);
}
