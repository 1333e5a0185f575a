use super::*;
use serde_json::json;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{body_partial_json, method, path},
};

fn config_for(server: &MockServer) -> ModelConfig {
    let url = Url::parse(&server.uri()).expect("mock server uri should parse");
    ModelConfig {
        protocol: url.scheme().to_string(),
        host: url.host_str().expect("mock server has a host").to_string(),
        port: url.port().expect("mock server has a port"),
        embedding_model: "nomic-embed-text:latest".to_string(),
        generation_model: "llama3.2:latest".to_string(),
        ..ModelConfig::default()
    }
}

async fn blocking<T, F>(f: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .expect("blocking task should not panic")
}

#[test]
fn family_detection() {
    assert_eq!(
        ModelFamily::detect("anthropic.claude-3-haiku-20240307-v1:0"),
        ModelFamily::Claude
    );
    assert_eq!(
        ModelFamily::detect("amazon.titan-text-express-v1"),
        ModelFamily::Titan
    );
    assert_eq!(ModelFamily::detect("llama3.2:latest"), ModelFamily::Generic);
    assert_eq!(ModelFamily::detect("Claude-Instant"), ModelFamily::Claude);
}

#[test]
fn family_defaults() {
    let claude = ModelFamily::Claude.default_params();
    assert_eq!(claude.max_tokens, 512);
    assert!((claude.temperature - 0.1).abs() < f32::EPSILON);
    assert_eq!(claude.top_p, Some(0.9));
    assert_eq!(claude.stop, None);

    let titan = ModelFamily::Titan.default_params();
    assert_eq!(titan.max_tokens, 512);
    assert_eq!(titan.top_p, None);
    assert_eq!(titan.stop, Some(Vec::new()));

    let generic = ModelFamily::Generic.default_params();
    assert_eq!(generic.max_tokens, 512);
    assert_eq!(generic.top_p, None);
    assert_eq!(generic.stop, None);
}

#[test]
fn overrides_replace_only_set_fields() {
    let overrides = GenerationOverrides {
        max_tokens: Some(1024),
        ..GenerationOverrides::default()
    };

    let params = GenerationParams::resolve("anthropic.claude-v2", &overrides);
    assert_eq!(params.max_tokens, 1024);
    assert_eq!(params.top_p, Some(0.9));
    assert!((params.temperature - 0.1).abs() < f32::EPSILON);
}

#[test]
fn overrides_merge_prefers_caller() {
    let configured = GenerationOverrides {
        max_tokens: Some(256),
        temperature: Some(0.5),
        ..GenerationOverrides::default()
    };
    let caller = GenerationOverrides {
        temperature: Some(0.0),
        stop: Some(vec!["\n\nHuman:".to_string()]),
        ..GenerationOverrides::default()
    };

    let merged = configured.merged_with(&caller);
    assert_eq!(merged.max_tokens, Some(256));
    assert_eq!(merged.temperature, Some(0.0));
    assert_eq!(merged.stop, Some(vec!["\n\nHuman:".to_string()]));
    assert!(GenerationOverrides::default().is_empty());
    assert!(!merged.is_empty());
}

#[test]
fn generate_options_wire_shape() {
    let options: GenerateOptions = ModelFamily::Generic.default_params().into();
    let value = serde_json::to_value(&options).expect("options serialize");
    assert_eq!(value, json!({"num_predict": 512, "temperature": 0.1_f32}));

    let options: GenerateOptions = ModelFamily::Titan.default_params().into();
    let value = serde_json::to_value(&options).expect("options serialize");
    assert_eq!(value["stop"], json!([]));
}

#[test]
fn client_configuration() {
    let config = ModelConfig {
        host: "inference-host".to_string(),
        port: 1234,
        retry_attempts: 3,
        ..ModelConfig::default()
    };
    let client = ModelClient::new(&config).expect("Failed to create client");

    assert_eq!(client.base_url().host_str(), Some("inference-host"));
    assert_eq!(client.base_url().port(), Some(1234));
    assert_eq!(client.embedding_model(), "nomic-embed-text:latest");
    assert_eq!(client.generation_model(), "llama3.2:latest");
    assert_eq!(client.retry_attempts, 3);
    assert_eq!(client.with_retry_attempts(0).retry_attempts, 1);
}

#[test]
fn invalid_endpoint_is_a_config_error() {
    let config = ModelConfig {
        host: "bad host name".to_string(),
        ..ModelConfig::default()
    };
    assert!(matches!(ModelClient::new(&config), Err(QaError::Config(_))));
}

#[test]
fn served_model_names_match_latest_tag() {
    assert!(model_matches("llama3.2:latest", "llama3.2:latest"));
    assert!(model_matches("llama3.2:latest", "llama3.2"));
    assert!(model_matches("llama3.2", "llama3.2:latest"));
    assert!(!model_matches("llama3.2:1b", "llama3.2"));
}

#[test]
fn empty_text_is_rejected_without_a_request() {
    let config = ModelConfig {
        port: 9,
        ..ModelConfig::default()
    };
    let client = ModelClient::new(&config).expect("client");

    assert!(matches!(client.embed(""), Err(QaError::Upstream(_))));
    assert!(matches!(client.embed("  \n\t"), Err(QaError::Upstream(_))));
    assert!(
        client
            .embed_batch(&[])
            .expect("empty batch is fine")
            .is_empty()
    );
}

#[tokio::test]
async fn embed_returns_vector() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .and(body_partial_json(json!({
            "model": "nomic-embed-text:latest",
            "input": ["What is NCM?"]
        })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"embeddings": [[0.1, 0.2, 0.3]]})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = ModelClient::new(&config_for(&server)).expect("client");
    let embedding = blocking(move || client.embed("What is NCM?"))
        .await
        .expect("embedding should succeed");

    assert_eq!(embedding, vec![0.1, 0.2, 0.3]);
}

#[tokio::test]
async fn embed_batch_sends_one_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "embeddings": [[1.0, 0.0], [0.0, 1.0], [0.5, 0.5]]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = ModelClient::new(&config_for(&server)).expect("client");
    let texts = vec!["a".to_string(), "b".to_string(), "c".to_string()];
    let embeddings = blocking(move || client.embed_batch(&texts))
        .await
        .expect("batch should succeed");

    assert_eq!(embeddings.len(), 3);
    assert_eq!(embeddings[1], vec![0.0, 1.0]);
}

#[tokio::test]
async fn embed_batch_count_mismatch_is_upstream() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"embeddings": [[1.0]]})))
        .mount(&server)
        .await;

    let client = ModelClient::new(&config_for(&server)).expect("client");
    let texts = vec!["a".to_string(), "b".to_string()];
    let result = blocking(move || client.embed_batch(&texts)).await;

    assert!(matches!(result, Err(QaError::Upstream(_))));
}

#[tokio::test]
async fn malformed_response_is_upstream() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&server)
        .await;

    let client = ModelClient::new(&config_for(&server)).expect("client");
    let result = blocking(move || client.embed("anode")).await;

    assert!(matches!(result, Err(QaError::Upstream(_))));
}

#[tokio::test]
async fn generate_sends_family_options() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(body_partial_json(json!({
            "model": "anthropic.claude-3-haiku",
            "prompt": "Explain SEI growth",
            "stream": false,
            "options": {"num_predict": 512, "top_p": 0.9_f32}
        })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"response": "SEI grows on the anode.", "done": true})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let config = ModelConfig {
        generation_model: "anthropic.claude-3-haiku".to_string(),
        ..config_for(&server)
    };
    let client = ModelClient::new(&config).expect("client");
    let answer = blocking(move || {
        client.generate("Explain SEI growth", &GenerationOverrides::default())
    })
    .await
    .expect("generation should succeed");

    assert_eq!(answer, "SEI grows on the anode.");
}

#[tokio::test]
async fn generate_applies_overrides() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(body_partial_json(json!({"options": {"num_predict": 64}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"response": "short"})))
        .expect(1)
        .mount(&server)
        .await;

    let client = ModelClient::new(&config_for(&server)).expect("client");
    let overrides = GenerationOverrides {
        max_tokens: Some(64),
        ..GenerationOverrides::default()
    };
    let answer = blocking(move || client.generate("prompt", &overrides))
        .await
        .expect("generation should succeed");

    assert_eq!(answer, "short");
}

#[tokio::test]
async fn rate_limit_is_upstream_and_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(429))
        .expect(1)
        .mount(&server)
        .await;

    let client = ModelClient::new(&config_for(&server))
        .expect("client")
        .with_retry_attempts(3);
    let result = blocking(move || client.generate("prompt", &GenerationOverrides::default())).await;

    assert!(matches!(result, Err(QaError::Upstream(_))));
}

#[tokio::test]
async fn server_error_is_not_retried_by_default() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;

    let client = ModelClient::new(&config_for(&server)).expect("client");
    let result = blocking(move || client.embed("cathode")).await;

    assert!(matches!(result, Err(QaError::Upstream(_))));
}

#[tokio::test]
async fn server_error_retries_when_configured() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(ResponseTemplate::new(500))
        .expect(2)
        .mount(&server)
        .await;

    let client = ModelClient::new(&config_for(&server))
        .expect("client")
        .with_retry_attempts(2);
    let result = blocking(move || client.embed("cathode")).await;

    assert!(matches!(result, Err(QaError::Upstream(_))));
}

#[tokio::test]
async fn slow_endpoint_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"response": "late"}))
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let client = ModelClient::new(&config_for(&server))
        .expect("client")
        .with_timeout(Duration::from_millis(250));
    let result = blocking(move || client.generate("prompt", &GenerationOverrides::default())).await;

    assert!(
        matches!(result, Err(QaError::Timeout(_))),
        "expected timeout, got {result:?}"
    );
}

#[tokio::test]
async fn health_check_requires_both_models() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "models": [
                {"name": "nomic-embed-text:latest", "size": 274_302_450_u64},
                {"name": "llama3.2:latest"}
            ]
        })))
        .mount(&server)
        .await;

    let client = ModelClient::new(&config_for(&server)).expect("client");
    let ok_client = client.clone();
    blocking(move || ok_client.health_check())
        .await
        .expect("both models are served");

    let missing = ModelConfig {
        generation_model: "mistral:7b".to_string(),
        ..config_for(&server)
    };
    let client = ModelClient::new(&missing).expect("client");
    let result = blocking(move || client.health_check()).await;
    assert!(matches!(result, Err(QaError::Upstream(_))));
}

#[tokio::test]
async fn ping_and_list_models() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"models": [{"name": "llama3.2:latest"}]})),
        )
        .mount(&server)
        .await;

    let client = ModelClient::new(&config_for(&server)).expect("client");
    let models = blocking(move || {
        client.ping()?;
        client.list_models()
    })
    .await
    .expect("listing should succeed");

    assert_eq!(models.len(), 1);
    assert_eq!(models[0].name, "llama3.2:latest");
}
