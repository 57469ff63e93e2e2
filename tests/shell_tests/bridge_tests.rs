use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use shell_loader::{
    event_types::EventType,
    shell::{ModuleFetcher, ShellContext, BRIDGE_VERSION},
};

use super::{crm_config, RecordingFetcher};

#[tokio::test]
async fn test_module_announcing_itself_unblocks_dependents() {
    let shell = ShellContext::new(crm_config()).unwrap();
    let fetcher = RecordingFetcher::new(Duration::from_millis(1));

    let mount = {
        let fetcher = fetcher.clone();
        let loader = shell.loader().clone();
        let dependencies = shell.graph().dependencies_of("contacts").to_vec();
        tokio::spawn(async move {
            let module = "contacts".to_string();
            loader
                .load_with_dependencies(
                    "contacts",
                    move || async move {
                        fetcher.fetch(&module).await
                    },
                    &dependencies,
                )
                .await
        })
    };

    // The dashboard is rendered by the host page and registers itself.
    tokio::task::yield_now().await;
    let bridge = shell.bridge();
    assert_eq!(bridge.version(), BRIDGE_VERSION);
    bridge.announce_ready("dashboard");

    mount.await.unwrap().unwrap();
    assert!(bridge.is_ready("contacts"));
    assert_eq!(fetcher.started(), vec!["contacts"]);
}

#[tokio::test]
async fn test_modules_exchange_events_through_bridges() {
    let shell = ShellContext::new(crm_config()).unwrap();
    let contacts = shell.bridge();
    let companies = shell.bridge();

    let received: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let subscription = companies.subscribe(EventType::NavChange.as_str(), move |data| {
        sink.lock().unwrap().push(data.clone());
        Ok(())
    });

    contacts.emit(EventType::NavChange.as_str(), &json!({ "path": "/companies/42" }));
    assert!(subscription.unsubscribe());
    contacts.emit(EventType::NavChange.as_str(), &json!({ "path": "/contacts" }));

    assert_eq!(
        *received.lock().unwrap(),
        vec![json!({ "path": "/companies/42" })]
    );
}

#[tokio::test]
async fn test_mount_announces_module_ready_to_bridges() {
    let shell = ShellContext::new(crm_config()).unwrap();
    let ready: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = ready.clone();
    let _subscription = shell
        .bridge()
        .subscribe(EventType::ModuleReady.as_str(), move |data| {
            let module = data["module"].as_str().ok_or("missing module name")?;
            sink.lock().unwrap().push(module.to_string());
            Ok(())
        });

    shell
        .mount_all(RecordingFetcher::new(Duration::from_millis(1)))
        .await
        .unwrap();

    assert_eq!(
        *ready.lock().unwrap(),
        vec!["dashboard", "contacts", "companies"]
    );
}

#[tokio::test]
async fn test_teardown_detaches_bridges() {
    let shell = ShellContext::new(crm_config()).unwrap();
    let bridge = shell.bridge();
    let calls = Arc::new(Mutex::new(0));
    let counter = calls.clone();
    let _subscription = bridge.subscribe(EventType::ThemeChange.as_str(), move |_| {
        *counter.lock().unwrap() += 1;
        Ok(())
    });

    shell
        .mount("dashboard", RecordingFetcher::new(Duration::from_millis(1)))
        .await
        .unwrap();
    assert!(bridge.is_ready("dashboard"));

    let bus = shell.bus().clone();
    shell.teardown();

    assert!(!bridge.is_attached());
    assert!(!bridge.is_ready("dashboard"));
    assert!(bus.ready_modules().is_empty());

    bridge.emit(EventType::ThemeChange.as_str(), &json!("dark"));
    bridge.announce_ready("contacts");
    assert_eq!(*calls.lock().unwrap(), 0);
    assert!(!bus.is_ready("contacts"));
}
