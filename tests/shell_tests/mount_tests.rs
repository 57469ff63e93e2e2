use std::time::Duration;

use pretty_assertions::assert_eq;
use shell_loader::{
    config::{self, ShellConfig},
    module_loader::{LoadError, LoadStatus},
    shell::ShellContext,
    Error,
};

use super::{crm_config, position, RecordingFetcher};

#[tokio::test]
async fn test_mount_all_starts_each_module_after_its_dependencies() {
    let shell = ShellContext::new(ShellConfig::builtin()).unwrap();
    let fetcher = RecordingFetcher::new(Duration::from_millis(5));

    shell.mount_all(fetcher.clone()).await.unwrap();

    let started = fetcher.started();
    let finished = fetcher.finished();
    assert_eq!(started.len(), 10);
    for name in shell.graph().modules() {
        for dependency in shell.graph().dependencies_of(name) {
            assert!(
                position(&finished, dependency) < position(&started, name),
                "{} started before {} finished",
                name,
                dependency
            );
        }
        assert_eq!(shell.loader().status(name), LoadStatus::Loaded);
    }
    assert_eq!(shell.bus().ready_modules().len(), 10);
}

#[tokio::test]
async fn test_preload_critical_mounts_only_preloaded_modules() {
    let shell = ShellContext::new(ShellConfig::builtin()).unwrap();
    let fetcher = RecordingFetcher::new(Duration::from_millis(1));

    shell.preload_critical(fetcher.clone()).await.unwrap();

    assert_eq!(fetcher.finished(), vec!["dashboard", "monitoring"]);
    assert!(!shell.loader().is_loaded("contacts"));
}

#[tokio::test]
async fn test_mount_is_idempotent() {
    let shell = ShellContext::new(crm_config()).unwrap();
    let fetcher = RecordingFetcher::new(Duration::from_millis(1));

    shell.mount("dashboard", fetcher.clone()).await.unwrap();
    shell.mount("dashboard", fetcher.clone()).await.unwrap();

    assert_eq!(fetcher.started(), vec!["dashboard"]);
}

#[tokio::test(start_paused = true)]
async fn test_failed_dependency_abandons_dependents() {
    let config = ShellConfig {
        dependency_timeout: Duration::from_millis(200),
        ..crm_config()
    };
    let shell = ShellContext::new(config).unwrap();
    let fetcher = RecordingFetcher::failing(Duration::from_millis(1), &["dashboard"]);

    let result = shell.mount_all(fetcher.clone()).await;
    assert!(matches!(result, Err(LoadError::LoadFailure { ref module, .. }) if module == "dashboard"));

    // Dependents still waiting were dropped along with mount_all.
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(shell.loader().status("dashboard"), LoadStatus::Failed);
    assert_eq!(fetcher.started(), vec!["dashboard"]);
    assert!(!shell.bus().is_ready("contacts"));
    assert_eq!(shell.bus().waiting_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_mount_reports_dependency_timeout() {
    let config = ShellConfig {
        dependency_timeout: Duration::from_millis(100),
        ..crm_config()
    };
    let shell = ShellContext::new(config).unwrap();
    let fetcher = RecordingFetcher::new(Duration::from_millis(1));

    let result = shell.mount("companies", fetcher.clone()).await;

    match result {
        Err(LoadError::DependencyTimeout { module, unready }) => {
            assert_eq!(module, "companies");
            assert_eq!(unready, vec!["contacts"]);
        }
        other => panic!("expected dependency timeout, got {:?}", other),
    }
    assert!(fetcher.started().is_empty());
}

#[test]
fn test_cycle_in_config_file_is_rejected() {
    let config: ShellConfig = config::from_str(
        r#"{
            "modules": [
                { "name": "messages", "dependencies": ["workflows"] },
                { "name": "workflows", "dependencies": ["messages"] }
            ]
        }"#,
    )
    .unwrap();

    match ShellContext::new(config) {
        Err(Error::Graph(e)) => assert!(e.to_string().contains("messages")),
        _ => panic!("cyclic configuration accepted"),
    }
}

#[test]
fn test_config_file_round_trip_through_context() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shell.json");
    std::fs::write(
        &path,
        r#"{
            "modules": [
                { "name": "dashboard", "priority": "critical" },
                { "name": "profile", "dependencies": ["dashboard"], "priority": "low" }
            ],
            "dependency_timeout": 1500
        }"#,
    )
    .unwrap();

    let shell = ShellContext::new(ShellConfig::from_file(&path).unwrap()).unwrap();
    assert_eq!(shell.load_order(), &["dashboard", "profile"]);
    assert_eq!(shell.critical_modules(), vec!["dashboard"]);
    assert_eq!(shell.config().dependency_timeout, Duration::from_millis(1500));
    assert_eq!(shell.config().wait_timeout, Duration::from_millis(30_000));
}

#[tokio::test]
async fn test_shared_fetcher_across_mounts() {
    let shell = ShellContext::new(crm_config()).unwrap();
    let fetcher = RecordingFetcher::new(Duration::from_millis(1));

    let (companies, dashboard, contacts) = tokio::join!(
        shell.mount("companies", fetcher.clone()),
        shell.mount("dashboard", fetcher.clone()),
        shell.mount("contacts", fetcher.clone()),
    );
    companies.unwrap();
    dashboard.unwrap();
    contacts.unwrap();

    assert_eq!(fetcher.finished(), vec!["dashboard", "contacts", "companies"]);
}
