use async_trait::async_trait;
use futures::StreamExt;
use runweave::events::{EventRecorder, Phase};
use runweave::nodes::{Lambda, passthrough_assign};
use runweave::{
  BatchOptions, Capabilities, ChunkStream, Node, RunContext, RunError, RunResult, Runnable,
  into_values, parallel,
};
use serde_json::{Value, json};
use std::error::Error;
use std::fmt;
use std::sync::Arc;

// Test types and errors
#[derive(Debug)]
enum TestError {
  Prompt(String),
  Parse(String),
}

impl fmt::Display for TestError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Prompt(msg) => write!(f, "Prompt error: {}", msg),
      Self::Parse(msg) => write!(f, "Parse error: {}", msg),
    }
  }
}

impl Error for TestError {}

// A prompt formatter implemented directly against the node interface
struct PromptTemplate {
  template: String,
}

#[async_trait]
impl Runnable for PromptTemplate {
  fn name(&self) -> &str {
    "prompt"
  }

  fn invoke(&self, input: Value, _ctx: &RunContext) -> RunResult<Value> {
    let topic = input
      .get("topic")
      .and_then(Value::as_str)
      .ok_or_else(|| RunError::leaf(TestError::Prompt("missing topic".to_string())))?;
    Ok(json!(self.template.replace("{topic}", topic)))
  }
}

// A fake model that streams its answer word by word
struct EchoModel;

#[async_trait]
impl Runnable for EchoModel {
  fn name(&self) -> &str {
    "model"
  }

  fn capabilities(&self) -> Capabilities {
    Capabilities::STREAMING
  }

  fn invoke(&self, input: Value, _ctx: &RunContext) -> RunResult<Value> {
    Ok(json!(format!("ANSWER: {}", input.as_str().unwrap_or_default())))
  }

  async fn ainvoke(&self, input: Value, ctx: &RunContext) -> RunResult<Value> {
    self.invoke(input, ctx)
  }

  fn astream(self: Arc<Self>, input: Value, ctx: RunContext) -> ChunkStream {
    let text = match self.invoke(input, &ctx) {
      Ok(Value::String(text)) => text,
      Ok(other) => other.to_string(),
      Err(err) => return Box::pin(futures::stream::once(async move { Err(err) })),
    };
    let words: Vec<RunResult<Value>> = text
      .split_inclusive(' ')
      .map(|word| Ok(json!(word)))
      .collect();
    Box::pin(futures::stream::iter(words))
  }
}

fn parser() -> Node {
  Node::new(Lambda::new("parser", |v: Value| {
    let text = v.as_str().unwrap_or_default();
    text
      .strip_prefix("ANSWER: ")
      .map(|answer| json!({ "answer": answer }))
      .ok_or_else(|| TestError::Parse(format!("unexpected output '{}'", text)))
  }))
}

fn chain() -> Node {
  Node::new(PromptTemplate {
    template: "Tell me about {topic}".to_string(),
  })
  .pipe(EchoModel)
  .pipe(parser())
}

#[test]
fn test_chain_invoke() {
  let out = chain()
    .invoke(json!({ "topic": "rust" }), &RunContext::new())
    .unwrap();
  assert_eq!(out, json!({ "answer": "Tell me about rust" }));
}

#[tokio::test]
async fn test_chain_ainvoke() {
  let out = chain()
    .ainvoke(json!({ "topic": "tokio" }), &RunContext::new())
    .await
    .unwrap();
  assert_eq!(out, json!({ "answer": "Tell me about tokio" }));
}

#[test]
fn test_chain_failure_points_at_step() {
  let err = tokio_test::assert_err!(chain().invoke(json!({}), &RunContext::new()));
  assert_eq!(err.failed_step(), Some(0));
  assert!(err.to_string().contains("Prompt error: missing topic"));
}

#[tokio::test]
async fn test_streamed_model_is_reduced_before_parser() {
  let recorder = Arc::new(EventRecorder::new());
  let ctx = RunContext::new().with_listener(recorder.clone());
  let chunks: Vec<Value> = chain()
    .astream(json!({ "topic": "fusion" }), &ctx)
    .map(|chunk| chunk.unwrap())
    .collect()
    .await;

  assert_eq!(chunks, vec![json!({ "answer": "Tell me about fusion" })]);
  assert_eq!(recorder.count("model", Phase::Chunk), 5);
  assert_eq!(recorder.count("parser", Phase::Start), 1);
}

#[test]
fn test_chain_batch() {
  let inputs = vec![json!({ "topic": "a" }), json!({}), json!({ "topic": "c" })];
  let results = chain()
    .batch(inputs, &RunContext::new(), &BatchOptions::default())
    .unwrap();
  assert!(results[0].is_ok());
  assert!(results[1].is_err());
  assert_eq!(results[2].as_ref().unwrap(), &json!({ "answer": "Tell me about c" }));
  assert!(matches!(
    into_values(results),
    Err(RunError::BatchPartialFailure { failed: 1, total: 3, .. })
  ));
}

#[tokio::test]
async fn test_retrieval_style_composition() {
  let retriever = Node::new(Lambda::new("retriever", |v: Value| {
    let question = v["question"].as_str().unwrap_or_default().to_string();
    Ok::<_, RunError>(json!([format!("doc about {}", question)]))
  }));
  let context = passthrough_assign([("documents", retriever)]).unwrap();
  let answer = Node::new(Lambda::new("answer", |v: Value| {
    Ok::<_, RunError>(json!(format!(
      "{} -> {}",
      v["question"].as_str().unwrap_or_default(),
      v["documents"][0].as_str().unwrap_or_default()
    )))
  }));
  let audit = Node::new(Lambda::new("audit", |v: Value| {
    Ok::<_, RunError>(json!(v.to_string().len()))
  }));
  let pipeline = context.pipe(parallel([("answer", answer), ("audit", audit)]).unwrap());

  let out = pipeline
    .ainvoke(json!({ "question": "ownership" }), &RunContext::new())
    .await
    .unwrap();
  assert_eq!(out["answer"], json!("ownership -> doc about ownership"));
  assert!(out["audit"].as_u64().unwrap() > 0);
}
