mod utils;

use std::sync::{Arc, Mutex};

use anyhow::Result;

use gordon::config::Settings;
use gordon::error::Error;
use gordon::events::{Event, EventKind, Subscriber};
use gordon::models::container::{LABEL_ATTACHMENT, LABEL_DOMAIN, LABEL_MANAGED, LABEL_PROXY_PORT};
use utils::{route, stack};

struct DegradedRecorder {
    domains: Mutex<Vec<String>>,
}

impl Subscriber for DegradedRecorder {
    fn name(&self) -> &str {
        "degraded-recorder"
    }

    fn can_handle(&self, kind: EventKind) -> bool {
        kind == EventKind::RouteDegraded
    }

    fn handle(&self, event: &Event) {
        if let Event::RouteDegraded { domain } = event {
            self.domains.lock().unwrap().push(domain.clone());
        }
    }
}

#[tokio::test]
async fn deploy_creates_labeled_running_container() -> Result<()> {
    let stack = stack(Settings::default());
    stack.runtime.add_image("myapp:latest", &[3000], &[]);
    stack.config.add_route(route("app.example.com", "myapp:latest")).await?;

    let container = stack
        .containers
        .deploy(&route("app.example.com", "myapp:latest"))
        .await?;

    assert!(container.is_running());
    assert_eq!(container.labels[LABEL_MANAGED], "true");
    assert_eq!(container.labels[LABEL_DOMAIN], "app.example.com");
    assert_eq!(container.labels[LABEL_PROXY_PORT], "3000");
    assert_eq!(
        stack.containers.get("app.example.com").await.unwrap().id,
        container.id
    );
    Ok(())
}

#[tokio::test]
async fn deploy_merges_env_with_user_overrides_winning() -> Result<()> {
    let stack = stack(Settings::default());
    stack
        .runtime
        .add_image("myapp:latest", &[8080], &["FOO=image", "BAR=image"]);
    stack.env.set("app.example.com", "FOO", "user").await?;

    stack
        .containers
        .deploy(&route("app.example.com", "myapp:latest"))
        .await?;

    let env = stack
        .env
        .resolved_env("app.example.com", &["FOO=image".into(), "BAR=image".into()])
        .await?;
    assert_eq!(env, vec!["BAR=image".to_string(), "FOO=user".to_string()]);
    Ok(())
}

#[tokio::test]
async fn redeploy_replaces_the_previous_container() -> Result<()> {
    let stack = stack(Settings::default());
    stack.runtime.add_image("myapp:v1", &[80], &[]);
    stack.runtime.add_image("myapp:v2", &[80], &[]);

    let first = stack
        .containers
        .deploy(&route("app.example.com", "myapp:v1"))
        .await?;
    let second = stack
        .containers
        .deploy(&route("app.example.com", "myapp:v2"))
        .await?;

    assert_ne!(first.id, second.id);
    let live = stack.runtime.containers();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].image, "myapp:v2");
    Ok(())
}

#[tokio::test]
async fn network_isolation_places_container_on_domain_network() -> Result<()> {
    let mut settings = Settings::default();
    settings.network_isolation.enabled = true;
    settings.network_isolation.prefix = "gordon".to_string();
    let stack = stack(settings);
    stack.runtime.add_image("myapp:latest", &[80], &[]);

    let container = stack
        .containers
        .deploy(&route("app.example.com", "myapp:latest"))
        .await?;

    assert_eq!(container.network.as_deref(), Some("gordon-app_example_com"));
    assert_eq!(stack.runtime.networks(), vec!["gordon-app_example_com"]);
    Ok(())
}

#[tokio::test]
async fn sync_deploys_missing_and_removes_orphans() -> Result<()> {
    let stack = stack(Settings::default());
    stack.runtime.add_image("myapp:latest", &[80], &[]);
    stack.config.add_route(route("app.example.com", "myapp:latest")).await?;
    // A leftover container whose route is gone.
    stack.runtime.seed_container("old.example.com", "old:latest", true);

    stack.containers.sync_containers().await?;

    assert_eq!(stack.runtime.running_domains(), vec!["app.example.com"]);
    Ok(())
}

#[tokio::test]
async fn sync_treats_normalized_image_names_as_equal() -> Result<()> {
    let stack = stack(Settings::default());
    stack
        .runtime
        .add_image("docker.io/library/nginx:latest", &[80], &[]);
    stack
        .runtime
        .seed_container("web.example.com", "docker.io/library/nginx:latest", true);
    stack.config.add_route(route("web.example.com", "nginx:latest")).await?;

    stack.containers.sync_containers().await?;

    // The seeded container satisfies the route; nothing new is created.
    let live = stack.runtime.containers();
    assert_eq!(live.len(), 1);
    assert!(live[0].id.starts_with("seeded"));
    Ok(())
}

#[tokio::test]
async fn image_push_redeploys_only_the_matching_route() -> Result<()> {
    let stack = stack(Settings::default());
    stack.runtime.add_image("myapp:latest", &[80], &[]);
    stack.runtime.add_image("other:latest", &[80], &[]);
    stack.config.add_route(route("app.example.com", "myapp:latest")).await?;
    stack.config.add_route(route("other.example.com", "other:latest")).await?;
    stack.containers.sync_containers().await?;

    let before_other = stack.runtime.pull_count("other:latest");
    let domain = stack.containers.on_image_pushed("myapp", "latest").await?;

    assert_eq!(domain.as_deref(), Some("app.example.com"));
    // The push forces a fresh pull of the matching image only.
    assert!(stack.runtime.pull_count("myapp:latest") >= 1);
    assert_eq!(stack.runtime.pull_count("other:latest"), before_other);
    Ok(())
}

#[tokio::test]
async fn unmatched_push_without_auto_route_is_ignored() -> Result<()> {
    let stack = stack(Settings::default());
    assert_eq!(stack.containers.on_image_pushed("ghost", "latest").await?, None);
    Ok(())
}

#[tokio::test]
async fn auto_route_registers_and_deploys_unmatched_push() -> Result<()> {
    let mut settings = Settings::default();
    settings.auto_route.enabled = true;
    settings.server.registry_domain = "example.com".to_string();
    let stack = stack(settings);
    stack.runtime.add_image("newapp:latest", &[80], &[]);

    let domain = stack.containers.on_image_pushed("newapp", "latest").await?;
    assert_eq!(domain.as_deref(), Some("newapp.example.com"));
    assert!(stack.config.get_route("newapp.example.com").await.is_ok());
    assert!(stack
        .containers
        .get("newapp.example.com")
        .await
        .unwrap()
        .is_running());
    Ok(())
}

#[tokio::test]
async fn attachments_join_after_owner_is_up() -> Result<()> {
    let mut settings = Settings::default();
    settings.network_isolation.enabled = true;
    settings
        .attachments
        .insert("app.example.com".to_string(), vec!["postgres:16".to_string()]);
    settings.routes.push(route("app.example.com", "myapp:latest"));
    let stack = stack(settings);
    stack.runtime.add_image("myapp:latest", &[80], &[]);
    stack.runtime.add_image("postgres:16", &[5432], &[]);

    // First pass: owner comes up, attachment joins on the second pass once
    // the owner is observed running.
    stack.containers.sync_containers().await?;
    stack.containers.sync_containers().await?;

    let attachment = stack
        .runtime
        .containers()
        .into_iter()
        .find(|c| c.labels.get(LABEL_ATTACHMENT).is_some())
        .expect("attachment container");
    assert_eq!(attachment.labels[LABEL_ATTACHMENT], "app.example.com");
    assert!(attachment.is_running());
    assert_eq!(
        attachment.network.as_deref(),
        Some("gordon-app_example_com")
    );
    Ok(())
}

#[tokio::test]
async fn attachment_for_network_group_deploys_without_owner() -> Result<()> {
    let mut settings = Settings::default();
    settings
        .attachments
        .insert("shared-db".to_string(), vec!["postgres:16".to_string()]);
    let stack = stack(settings);
    stack.runtime.add_image("postgres:16", &[5432], &[]);

    stack.containers.sync_containers().await?;

    assert!(stack
        .runtime
        .containers()
        .iter()
        .any(|c| c.labels.get(LABEL_ATTACHMENT).map(String::as_str) == Some("shared-db")));
    Ok(())
}

#[tokio::test]
async fn failed_pull_reports_deploy_failed_and_backs_off() -> Result<()> {
    let stack = stack(Settings::default());
    stack.runtime.fail_pulls_for("broken:latest");
    stack.config.add_route(route("bad.example.com", "broken:latest")).await?;

    let err = stack
        .containers
        .deploy(&route("bad.example.com", "broken:latest"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DeployFailed { .. }));

    // Reconciliation honors the backoff window instead of hammering pulls.
    let pulls_after_failure = stack.runtime.pull_count("broken:latest");
    stack.containers.sync_containers().await?;
    assert_eq!(stack.runtime.pull_count("broken:latest"), pulls_after_failure);
    Ok(())
}

#[tokio::test]
async fn fifth_consecutive_failure_emits_route_degraded_once() -> Result<()> {
    let stack = stack(Settings::default());
    stack.runtime.fail_pulls_for("broken:latest");
    let recorder = Arc::new(DegradedRecorder {
        domains: Mutex::new(Vec::new()),
    });
    stack.events.subscribe(recorder.clone());

    for attempt in 1..=6 {
        let result = stack
            .containers
            .deploy(&route("bad.example.com", "broken:latest"))
            .await;
        assert!(result.is_err(), "attempt {attempt} should fail");
    }

    // The threshold crossing is announced exactly once per streak.
    assert_eq!(
        *recorder.domains.lock().unwrap(),
        vec!["bad.example.com".to_string()]
    );
    Ok(())
}

#[tokio::test]
async fn shutdown_stops_and_removes_everything() -> Result<()> {
    let stack = stack(Settings::default());
    stack.runtime.add_image("myapp:latest", &[80], &[]);
    stack.config.add_route(route("app.example.com", "myapp:latest")).await?;
    stack.containers.sync_containers().await?;
    assert!(!stack.runtime.containers().is_empty());

    stack.containers.shutdown().await;
    assert!(stack.runtime.containers().is_empty());
    assert!(stack.containers.get("app.example.com").await.is_none());
    Ok(())
}

#[tokio::test]
async fn explicit_route_port_overrides_image_ports() -> Result<()> {
    let stack = stack(Settings::default());
    stack.runtime.add_image("myapp:latest", &[80, 8080], &[]);
    let mut r = route("app.example.com", "myapp:latest");
    r.port = Some(9999);

    let container = stack.containers.deploy(&r).await?;
    assert_eq!(container.labels[LABEL_PROXY_PORT], "9999");
    Ok(())
}
