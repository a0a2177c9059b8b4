//! HTTP model client against a wiremock OpenAI-compatible endpoint.

use futures::StreamExt;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use council::client::{ChatBackend, ChatMessage, ChatOptions, HttpModelClient, StreamChunk};
use council::config::ModelEndpoint;
use council::error::CouncilError;

fn endpoint(server: &MockServer, model: &str, api_key: Option<&str>) -> ModelEndpoint {
    ModelEndpoint {
        model: model.to_string(),
        base_url: format!("{}/v1", server.uri()),
        api_key: api_key.map(str::to_string),
    }
}

#[tokio::test]
async fn test_complete_splits_inline_thinking() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({"model": "phi-4", "stream": false})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"content": "<think>weighing options</think>The answer is 4."}}]
        })))
        .mount(&server)
        .await;

    let client = HttpModelClient::new();
    let output = client
        .complete(
            &endpoint(&server, "phi-4", None),
            &[ChatMessage::user("2+2?")],
            &ChatOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(output.content, "The answer is 4.");
    assert_eq!(output.thinking.as_deref(), Some("weighing options"));
}

#[tokio::test]
async fn test_complete_prefers_structured_reasoning_field() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {
                "content": "Plain answer.",
                "reasoning_content": "structured reasoning"
            }}]
        })))
        .mount(&server)
        .await;

    let client = HttpModelClient::new();
    let output = client
        .complete(
            &endpoint(&server, "m", None),
            &[ChatMessage::user("q")],
            &ChatOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(output.content, "Plain answer.");
    assert_eq!(output.thinking.as_deref(), Some("structured reasoning"));
}

#[tokio::test]
async fn test_api_key_sent_as_bearer() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer secret-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"content": "ok"}}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = HttpModelClient::new();
    let output = client
        .complete(
            &endpoint(&server, "m", Some("secret-key")),
            &[ChatMessage::user("q")],
            &ChatOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(output.content, "ok");
}

#[tokio::test]
async fn test_streaming_chunks_and_done() {
    let server = MockServer::start().await;
    let body = concat!(
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hello \"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"world\"}}]}\n\n",
        "data: [DONE]\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({"stream": true})))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let client = HttpModelClient::new();
    let stream = client
        .complete_stream(
            &endpoint(&server, "m", None),
            &[ChatMessage::user("q")],
            &ChatOptions::default(),
        )
        .await
        .unwrap();

    let chunks: Vec<_> = stream.collect().await;
    let chunks: Vec<StreamChunk> = chunks.into_iter().map(|c| c.unwrap()).collect();

    assert_eq!(chunks[0], StreamChunk::Content("Hello ".to_string()));
    assert_eq!(chunks[1], StreamChunk::Content("world".to_string()));
    match chunks.last().unwrap() {
        StreamChunk::Done(output) => assert_eq!(output.content, "Hello world"),
        other => panic!("expected Done, got {:?}", other),
    }
}

#[tokio::test]
async fn test_missing_model_maps_to_model_not_loaded() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(404).set_body_string("model not found"))
        .mount(&server)
        .await;

    let client = HttpModelClient::new();
    let err = client
        .complete(
            &endpoint(&server, "ghost-model", None),
            &[ChatMessage::user("q")],
            &ChatOptions::default(),
        )
        .await
        .unwrap_err();
    match err {
        CouncilError::ModelNotLoaded(model) => assert_eq!(model, "ghost-model"),
        other => panic!("expected ModelNotLoaded, got {other}"),
    }
}

#[tokio::test]
async fn test_server_error_is_protocol_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let client = HttpModelClient::new();
    let err = client
        .complete(
            &endpoint(&server, "m", None),
            &[ChatMessage::user("q")],
            &ChatOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CouncilError::ProtocolError { .. }));
}

#[tokio::test]
async fn test_list_models() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{"id": "phi-4-mini"}, {"id": "gemma-3-12b"}]
        })))
        .mount(&server)
        .await;

    let client = HttpModelClient::new();
    let models = client
        .list_models(&format!("{}/v1", server.uri()))
        .await
        .unwrap();
    assert_eq!(models, vec!["phi-4-mini", "gemma-3-12b"]);
}

#[tokio::test]
async fn test_unreachable_endpoint() {
    let client = HttpModelClient::new();
    // Port 1 on loopback: nothing listens there.
    let err = client.list_models("http://127.0.0.1:1/v1").await.unwrap_err();
    assert!(matches!(err, CouncilError::BackendUnreachable { .. }));
}
