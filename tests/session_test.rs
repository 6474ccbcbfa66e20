mod common;

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use common::{FailingModel, GatedModel, GradientModel};
use kornia_imagine::{
    ImagineError, codec,
    config::{DEFAULT_PROMPT, PromptPolicy},
    model::{ModelHandle, ModelLoader},
    session::{GenerationSession, SessionPhase},
};

const TIMEOUT: Duration = Duration::from_secs(10);

fn gradient_session(width: usize, height: usize) -> GenerationSession<GradientModel> {
    let handle = ModelHandle::new(GradientModel::new(width, height));
    GenerationSession::new(handle, PromptPolicy::RejectEmpty)
}

#[test]
fn test_generated_artifact_decodes_to_same_dimensions() {
    let session = gradient_session(48, 24);

    session.submit("a lighthouse in a storm").unwrap();
    let snapshot = session.wait_for_completion(TIMEOUT);
    assert_eq!(snapshot.status, SessionPhase::Done);
    assert_eq!(snapshot.width, Some(48));
    assert_eq!(snapshot.height, Some(24));

    let output = session.present().unwrap();
    assert!(!output.artifact.bytes().is_empty());

    let decoded = codec::decode(output.artifact.bytes()).unwrap();
    assert_eq!(decoded.size(), output.size);
    assert_eq!(decoded.width(), 48);
    assert_eq!(decoded.height(), 24);
}

#[test]
fn test_each_trigger_produces_a_fresh_image() {
    let session = gradient_session(8, 8);

    let first_id = session.submit("same prompt").unwrap();
    session.wait_for_completion(TIMEOUT);
    let first = session.present().unwrap();

    let second_id = session.submit("same prompt").unwrap();
    session.wait_for_completion(TIMEOUT);
    let second = session.present().unwrap();

    assert_ne!(first_id, second_id);
    assert_eq!(session.model().calls(), 2);
    assert!(!Arc::ptr_eq(&first, &second));
    assert_ne!(first.artifact.bytes(), second.artifact.bytes());
}

#[test]
fn test_progress_reaches_100_for_any_prompt() {
    let session = gradient_session(4, 4);

    for prompt in ["short", DEFAULT_PROMPT, "multi\nline\nprompt"] {
        session.submit(prompt).unwrap();
        let snapshot = session.wait_for_completion(TIMEOUT);
        assert_eq!(snapshot.status, SessionPhase::Done);
        assert_eq!(snapshot.percent, 100);
        assert_eq!(snapshot.step, snapshot.total_steps);
        assert_eq!(snapshot.prompt.as_deref(), Some(prompt));
    }
}

#[test]
fn test_failed_generation_reports_error_and_completes_progress() {
    let session = GenerationSession::new(ModelHandle::new(FailingModel), PromptPolicy::default());

    session.submit("anything").unwrap();
    let snapshot = session.wait_for_completion(TIMEOUT);

    assert_eq!(snapshot.status, SessionPhase::Failed);
    assert_eq!(snapshot.percent, 100);
    assert!(snapshot.error.unwrap().contains("ran out of memory"));
    assert!(session.present().is_none());

    // the session accepts new prompts after a failure
    session.submit("again").unwrap();
    assert_eq!(
        session.wait_for_completion(TIMEOUT).status,
        SessionPhase::Failed
    );
}

#[test]
fn test_trigger_while_generating_is_rejected() {
    let (model, release) = GatedModel::new(4, 4);
    let session = GenerationSession::new(ModelHandle::new(model), PromptPolicy::default());

    session.submit("first").unwrap();
    let snapshot = session.poll();
    assert_eq!(snapshot.status, SessionPhase::Generating);
    assert!(snapshot.percent < 100);

    assert!(matches!(session.submit("second"), Err(ImagineError::Busy)));

    release.send(()).unwrap();
    let snapshot = session.wait_for_completion(TIMEOUT);
    assert_eq!(snapshot.status, SessionPhase::Done);
    assert_eq!(snapshot.prompt.as_deref(), Some("first"));

    release.send(()).unwrap();
    session.submit("second").unwrap();
    assert_eq!(
        session.wait_for_completion(TIMEOUT).status,
        SessionPhase::Done
    );
}

#[test]
fn test_new_request_does_not_show_previous_progress() {
    let (model, release) = GatedModel::new(4, 4);
    let session = GenerationSession::new(ModelHandle::new(model), PromptPolicy::default());

    release.send(()).unwrap();
    session.submit("first").unwrap();
    assert_eq!(session.wait_for_completion(TIMEOUT).percent, 100);

    session.submit("second").unwrap();
    for _ in 0..20 {
        let snapshot = session.poll();
        assert_eq!(snapshot.status, SessionPhase::Generating);
        assert!(snapshot.percent < 100);
        std::thread::sleep(Duration::from_millis(5));
    }

    release.send(()).unwrap();
    assert_eq!(session.wait_for_completion(TIMEOUT).percent, 100);
}

#[test]
fn test_empty_prompt_rejected_by_default() {
    let session = gradient_session(4, 4);

    assert!(matches!(session.submit(""), Err(ImagineError::EmptyPrompt)));
    assert!(matches!(
        session.submit("   \n  "),
        Err(ImagineError::EmptyPrompt)
    ));
    assert_eq!(session.poll().status, SessionPhase::Idle);
    assert_eq!(session.model().calls(), 0);
}

#[test]
fn test_empty_prompt_passed_through_when_allowed() {
    let handle = ModelHandle::new(GradientModel::new(4, 4));
    let session = GenerationSession::new(handle, PromptPolicy::PassThrough);

    session.submit("").unwrap();
    let snapshot = session.wait_for_completion(TIMEOUT);
    assert_eq!(snapshot.status, SessionPhase::Done);
    assert_eq!(snapshot.prompt.as_deref(), Some(""));
}

#[test]
fn test_idle_session_has_nothing_to_present() {
    let session = gradient_session(4, 4);
    let snapshot = session.poll();
    assert_eq!(snapshot.status, SessionPhase::Idle);
    assert_eq!(snapshot.percent, 0);
    assert!(session.present().is_none());
}

#[test]
fn test_loader_returns_same_handle() {
    let loads = Arc::new(AtomicUsize::new(0));
    let loader = ModelLoader::new({
        let loads = loads.clone();
        move || {
            loads.fetch_add(1, Ordering::SeqCst);
            Ok(GradientModel::new(4, 4))
        }
    });

    let first = loader.ensure_model_loaded().unwrap();
    let second = loader.ensure_model_loaded().unwrap();

    assert!(ModelHandle::ptr_eq(&first, &second));
    assert_eq!(loads.load(Ordering::SeqCst), 1);
    assert!(loader.is_loaded());
}

#[test]
fn test_loader_failure_is_propagated() {
    let loader: ModelLoader<GradientModel> =
        ModelLoader::new(|| Err(ImagineError::ModelLoad("weights not found".into())));

    let result = loader.ensure_model_loaded();
    assert!(matches!(result, Err(ImagineError::ModelLoad(_))));
    assert!(!loader.is_loaded());
}

#[test]
fn test_session_shares_the_loaded_handle() {
    let loader = ModelLoader::new(|| Ok(GradientModel::new(4, 4)));
    let handle = loader.ensure_model_loaded().unwrap();
    let session = GenerationSession::new(handle, PromptPolicy::default());

    session.submit("shared").unwrap();
    session.wait_for_completion(TIMEOUT);

    let again = loader.ensure_model_loaded().unwrap();
    assert!(ModelHandle::ptr_eq(session.model(), &again));
    assert_eq!(again.calls(), 1);
}
