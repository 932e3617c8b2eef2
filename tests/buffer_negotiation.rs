// tests/buffer_negotiation.rs

//! Size-then-fill retrieval seen through the agent handle, against an
//! engine whose replies are scripted per call.

use std::sync::{Arc, Mutex};

use tdt_agent::{
    engine::{fill_buffer, Engine, EngineBackend, FillReply, MAX_FILL_ATTEMPTS},
    notify::Context,
    Agent, NotificationRegistry, ProtocolFormat, ResultCode,
};

/// One reply to a discover/get_configuration call.
#[derive(Clone)]
enum Step {
    /// Fill `payload` with `code` when the buffer fits, else report its size.
    Payload(&'static str, ResultCode),
    /// Reply with `code` and no size, whatever the buffer.
    Code(ResultCode),
}

#[derive(Default)]
struct Script {
    steps: Vec<Step>,
    calls: Vec<Option<usize>>,
}

struct ScriptedEngine {
    script: Arc<Mutex<Script>>,
}

impl ScriptedEngine {
    fn next(&self, buffer: Option<&mut [u8]>) -> FillReply {
        let mut script = self.script.lock().unwrap();
        script.calls.push(buffer.as_ref().map(|b| b.len()));
        let step = if script.steps.len() > 1 {
            script.steps.remove(0)
        } else {
            script.steps[0].clone()
        };
        match step {
            Step::Payload(text, code) => fill_buffer(text, code, buffer),
            Step::Code(code) => FillReply::code(code),
        }
    }
}

impl Engine for ScriptedEngine {
    fn start(&self) -> ResultCode {
        ResultCode::NotImplemented
    }
    fn stop(&self, _profile: Option<&str>) -> ResultCode {
        ResultCode::NotImplemented
    }
    fn discover(&self, buffer: Option<&mut [u8]>) -> FillReply {
        self.next(buffer)
    }
    fn get_configuration(&self, _profile: Option<&str>, buffer: Option<&mut [u8]>) -> FillReply {
        self.next(buffer)
    }
    fn set_configuration(&self, _profile: Option<&str>, _payload: &str) -> ResultCode {
        ResultCode::NotImplemented
    }
    fn set_notification_callback(&self, _context: Context, _registry: Arc<NotificationRegistry>) -> ResultCode {
        ResultCode::NotImplemented
    }
}

struct ScriptedBackend {
    script: Arc<Mutex<Script>>,
}

impl EngineBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }
    fn construct(&self, _format: ProtocolFormat) -> Option<Box<dyn Engine>> {
        Some(Box::new(ScriptedEngine { script: Arc::clone(&self.script) }))
    }
    fn error_string(&self, _code: ResultCode) -> Option<String> {
        None
    }
}

fn scripted(steps: Vec<Step>) -> (Agent, Arc<Mutex<Script>>) {
    let script = Arc::new(Mutex::new(Script { steps, calls: Vec::new() }));
    let backend = Arc::new(ScriptedBackend { script: Arc::clone(&script) });
    let mut agent = Agent::new(backend, NotificationRegistry::new());
    agent.construct(ProtocolFormat::Json).unwrap();
    (agent, script)
}

#[test]
fn payload_is_sized_then_filled_exactly() {
    let text = r#"{"configurations":[{"p":{"k":1}},{"eof":null}]}"#;
    let (agent, script) = scripted(vec![Step::Payload(text, ResultCode::Success)]);

    let (got, code) = agent.get_configuration("p");
    assert_eq!(code, ResultCode::Success);
    assert_eq!(got, text);
    assert_eq!(script.lock().unwrap().calls, vec![None, Some(text.len() + 1)]);
}

#[test]
fn warning_returns_partial_payload() {
    let (agent, _) = scripted(vec![Step::Payload("{\"profiles\":[]}", ResultCode::NotAllProfilesLoaded)]);
    let (got, code) = agent.discover();
    assert_eq!(code, ResultCode::NotAllProfilesLoaded);
    assert_eq!(got, "{\"profiles\":[]}");
}

#[test]
fn non_size_first_reply_ends_exchange() {
    let (agent, script) = scripted(vec![Step::Code(ResultCode::ProfilesDirNotExists)]);
    assert_eq!(agent.discover(), (String::new(), ResultCode::ProfilesDirNotExists));
    assert_eq!(script.lock().unwrap().calls.len(), 1);
}

#[test]
fn growth_between_calls_is_retried() {
    let (agent, script) = scripted(vec![
        Step::Payload("abc", ResultCode::Success),
        Step::Payload("abcdefgh", ResultCode::Success),
        Step::Payload("abcdefgh", ResultCode::Success),
    ]);
    let (got, code) = agent.discover();
    assert_eq!(code, ResultCode::Success);
    assert_eq!(got, "abcdefgh");
    assert_eq!(script.lock().unwrap().calls, vec![None, Some(4), Some(9)]);
}

#[test]
fn error_during_fill_discards_partial_data() {
    let (agent, _) = scripted(vec![
        Step::Payload("abc", ResultCode::Success),
        Step::Code(ResultCode::AgentAborted),
    ]);
    assert_eq!(agent.discover(), (String::new(), ResultCode::AgentAborted));
}

#[test]
fn insufficient_size_never_reaches_the_caller() {
    let (agent, script) = scripted(vec![Step::Code(ResultCode::InsufficientBufferSize)]);
    let (got, code) = agent.discover();
    assert_ne!(code, ResultCode::InsufficientBufferSize);
    assert_eq!(code, ResultCode::Internal);
    assert!(got.is_empty());
    assert!(script.lock().unwrap().calls.len() <= MAX_FILL_ATTEMPTS + 1);
}
