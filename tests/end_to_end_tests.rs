//! Config file to stored report, against a wiremock target.

use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use rust_apisweep::client::{build_client, ClientConfig, PoolConfig};
use rust_apisweep::config::{ConfigError, SuiteConfig};
use rust_apisweep::executor::HttpExecutor;
use rust_apisweep::prober::{NetworkProber, ProbeTarget};
use rust_apisweep::prompts::PromptSource;
use rust_apisweep::report::render_sweep;
use rust_apisweep::scheduler::{RunLabels, SweepPlan, SweepScheduler, SweepStatus};
use rust_apisweep::store::{JsonFileStore, ResultStore};

fn write_config(dir: &TempDir, base_url: &str) -> std::path::PathBuf {
    let prompt_file = dir.path().join("prompts.jsonl");
    std::fs::write(
        &prompt_file,
        "{\"question\": \"What is a mutex?\"}\n{\"question\": \"Explain backpressure.\"}\n",
    )
    .unwrap();

    let config = format!(
        r#"
api_configs:
  mock:
    name: Mock API
    base_url: {base_url}
    endpoints:
      chat: /v1/chat/completions
    headers:
      Authorization: "Bearer {{api_key}}"
    request_format:
      model: mock-model
      messages:
        - role: user
          content: "{{prompt}}"
test_configs:
  smoke:
    name: Smoke sweep
    concurrent_levels: [1, 2]
    requests_per_level: 4
    timeout: 5s
    retry_count: 1
    retry_initial_delay: 10ms
    retry_max_delay: 20ms
monitoring:
  probe_interval: 20ms
  probe_timeout: 1s
analysis:
  rps_gain_tolerance: 0.05
  max_error_rate: 0.05
data:
  prompt_file: {prompt_file}
"#,
        base_url = base_url,
        prompt_file = prompt_file.display()
    );

    let path = dir.path().join("config.yaml");
    std::fs::write(&path, config).unwrap();
    path
}

#[tokio::test]
async fn sweep_from_config_file_is_stored_and_reported() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"usage": {"input_tokens": 10, "output_tokens": 20}}))
                .set_delay(Duration::from_millis(20)),
        )
        .expect(8)
        .mount(&server)
        .await;
    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let config_path = write_config(&dir, &server.uri());

    let suite = SuiteConfig::from_file(&config_path).unwrap();
    let plan = suite.test("smoke").unwrap().to_plan().unwrap();
    let profile = Arc::new(suite.api("mock").unwrap().clone());
    let prompts = PromptSource::from_file(suite.data.prompt_file.as_ref().unwrap()).unwrap();
    assert_eq!(prompts.len(), 2);

    let client = build_client(&ClientConfig {
        pool: PoolConfig::for_max_level(2),
        ..ClientConfig::default()
    })
    .unwrap();
    let vars = BTreeMap::from([("api_key".to_string(), "sk-test".to_string())]);
    let executor =
        HttpExecutor::new(client, profile.clone(), "chat", vars, plan.timeout, plan.retry).unwrap();

    let (interval, timeout) = suite.probe_timing().unwrap();
    let target = ProbeTarget::resolve(suite.monitoring.method, None, &profile.base_url).unwrap();
    let prober = NetworkProber::new(target, interval, timeout).unwrap();

    let result = SweepScheduler::new(
        Arc::new(executor),
        prompts,
        SweepPlan::from(&plan),
        RunLabels {
            api_name: "mock".to_string(),
            test_name: "smoke".to_string(),
            endpoint: "chat".to_string(),
        },
    )
    .with_analysis(suite.analysis)
    .with_prober(prober)
    .run()
    .await
    .unwrap();

    assert_eq!(result.status, SweepStatus::Completed);
    assert_eq!(result.levels.len(), 2);
    for level in &result.levels {
        assert_eq!(level.success_count, 4);
        assert_eq!(level.total_tokens, 120);
        assert_eq!(level.total_retries, 0);
    }
    assert!(result.network.is_some());
    assert!(result.optimal().is_some());

    let store = JsonFileStore::new(dir.path().join("results"));
    store.save(&result).await.unwrap();

    let loaded = store.load(&result.run_id).await.unwrap();
    assert_eq!(loaded.run_id, result.run_id);
    assert_eq!(loaded.labels, result.labels);
    assert_eq!(loaded.levels.len(), 2);
    assert_eq!(loaded.totals.total_requests, 8);

    let history = store.list(5).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].run_id, result.run_id);

    let text = render_sweep(&loaded);
    assert!(text.contains(&result.run_id));
    assert!(text.contains("Optimal concurrency"));
}

#[test]
fn config_errors_surface_before_any_request() {
    let dir = TempDir::new().unwrap();

    let path = dir.path().join("bad.yaml");
    std::fs::write(
        &path,
        r#"
test_configs:
  broken:
    name: Broken
    concurrent_levels: []
    requests_per_level: 0
"#,
    )
    .unwrap();
    let err = SuiteConfig::from_file(&path).unwrap_err();
    let message = err.to_string();
    assert!(matches!(err, ConfigError::Validation(_)));
    assert!(message.contains("concurrent_levels"), "{}", message);
    assert!(message.contains("requests_per_level"), "{}", message);

    let missing = SuiteConfig::from_file(dir.path().join("missing.yaml"));
    assert!(matches!(missing, Err(ConfigError::FileRead(_))));

    let unknown = dir.path().join("unknown.yaml");
    std::fs::write(&unknown, "test_configs: {}\nreporting: {}\n").unwrap();
    assert!(matches!(
        SuiteConfig::from_file(&unknown),
        Err(ConfigError::YamlParse(_))
    ));
}
