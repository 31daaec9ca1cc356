//! Session lifecycle against a mock backend.
//!
//! Run with: cargo test --test session_tests

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{client_with, drain, eventually, mint_token, seeded_storage, test_config};
use futures::future::join_all;
use serde_json::{json, Value};
use sprintdesk::cache::QueryKey;
use sprintdesk::storage::{MemoryStorage, Storage};
use sprintdesk::{ClientError, SessionBus, SessionEvent, SessionState};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const DEAD_WS: &str = "ws://127.0.0.1:1";

fn logged_out_count(events: &[SessionEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, SessionEvent::LoggedOut { .. }))
        .count()
}

#[tokio::test]
async fn test_concurrent_401s_share_one_refresh() {
    let server = MockServer::start().await;
    let stale = mint_token("u1", 3600);
    let fresh = mint_token("u1-renewed", 3600);

    Mock::given(method("GET"))
        .and(path("/projects/P1/tasks"))
        .and(header("authorization", format!("Bearer {stale}").as_str()))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/projects/P1/tasks"))
        .and(header("authorization", format!("Bearer {fresh}").as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": "T1"}])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"token": fresh, "userID": "u1"}))
                .set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = client_with(
        test_config(&server.uri(), DEAD_WS),
        seeded_storage("u1", &stale),
        SessionBus::default(),
    );

    let requests = (0..8).map(|_| client.api().get::<Value>("/projects/P1/tasks"));
    let results = join_all(requests).await;

    for result in results {
        let body = result.unwrap();
        assert_eq!(body[0]["id"], "T1");
    }
    assert_eq!(client.coordinator().refresh_count(), 1);
    assert_eq!(client.coordinator().get_token().as_deref(), Some(fresh.as_str()));
}

#[tokio::test]
async fn test_rejected_refresh_fails_all_waiters_with_original_401_and_logs_out_once() {
    let server = MockServer::start().await;
    let stale = mint_token("u1", 3600);

    Mock::given(method("GET"))
        .and(path("/projects/P1/tasks"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({"error": "token expired"})))
        .mount(&server)
        .await;
    // One initial call plus the single 401 retry
    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(
            ResponseTemplate::new(401)
                .set_body_json(json!({"error": "refresh token revoked"}))
                .set_delay(Duration::from_millis(50)),
        )
        .expect(2)
        .mount(&server)
        .await;

    let bus = SessionBus::default();
    let mut rx = bus.subscribe();
    let client = client_with(
        test_config(&server.uri(), DEAD_WS),
        seeded_storage("u1", &stale),
        bus,
    );
    let requests = (0..5).map(|_| client.api().get::<Value>("/projects/P1/tasks"));
    let results = join_all(requests).await;

    for result in results {
        match result {
            Err(ClientError::Unauthenticated(e)) => {
                assert_eq!(e.status, Some(401));
                assert!(e.url.ends_with("/projects/P1/tasks"));
                assert_eq!(e.body["error"], "token expired");
            }
            other => panic!("expected original 401, got {other:?}"),
        }
    }

    assert!(eventually(Duration::from_secs(2), || client.state() == SessionState::Unauthenticated).await);
    // Let any duplicate logout surface before counting
    tokio::time::sleep(Duration::from_millis(100)).await;

    let events = drain(&mut rx);
    assert_eq!(logged_out_count(&events), 1);
    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::LoggedOut {
            deliberate: false,
            ..
        }
    )));
    assert!(client.coordinator().get_token().is_none());
    assert!(client.user_id().is_none());
}

#[tokio::test]
async fn test_transient_refresh_failure_preserves_session() {
    let server = MockServer::start().await;
    let token = mint_token("u1", 3600);

    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let storage = seeded_storage("u1", &token);
    let bus = SessionBus::default();
    let mut rx = bus.subscribe();
    let client = client_with(test_config(&server.uri(), DEAD_WS), storage.clone(), bus);

    let err = client.initialize().await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(err.status(), Some(503));

    assert_eq!(client.state(), SessionState::Authenticated);
    assert_eq!(client.coordinator().get_token().as_deref(), Some(token.as_str()));
    assert_eq!(client.user_id().as_deref(), Some("u1"));
    assert_eq!(storage.get("token").as_deref(), Some(token.as_str()));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(logged_out_count(&drain(&mut rx)), 0);
}

#[tokio::test]
async fn test_initialize_refreshes_unconditionally() {
    let server = MockServer::start().await;
    // Still valid for an hour; refreshed anyway
    let current = mint_token("u1", 3600);
    let renewed = mint_token("u1", 7200);

    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": renewed, "userID": "u1"})))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_with(
        test_config(&server.uri(), DEAD_WS),
        seeded_storage("u1", &current),
        SessionBus::default(),
    );
    let state = client.initialize().await.unwrap();
    assert_eq!(state, SessionState::Authenticated);
    assert_eq!(client.coordinator().get_token().as_deref(), Some(renewed.as_str()));
}

#[tokio::test]
async fn test_refresh_completing_after_logout_is_discarded() {
    let server = MockServer::start().await;
    let current = mint_token("u1", 3600);
    let late = mint_token("u1", 7200);

    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": current, "userID": "u1"})))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"token": late, "userID": "u1"}))
                .set_delay(Duration::from_millis(300)),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/logout"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let bus = SessionBus::default();
    let client = client_with(
        test_config(&server.uri(), DEAD_WS),
        seeded_storage("u1", &current),
        bus.clone(),
    );
    assert_eq!(client.initialize().await.unwrap(), SessionState::Authenticated);

    let mut rx = bus.subscribe();
    let pending = {
        let coordinator = Arc::clone(client.coordinator());
        tokio::spawn(async move { coordinator.refresh().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(client.coordinator().is_refreshing());
    client.logout().await;

    assert!(pending.await.unwrap().is_err());
    assert_eq!(client.state(), SessionState::Unauthenticated);
    assert!(client.coordinator().get_token().is_none());
    assert!(client.coordinator().tokens().user_id().is_none());

    tokio::time::sleep(Duration::from_millis(50)).await;
    let events = drain(&mut rx);
    assert!(!events
        .iter()
        .any(|e| matches!(e, SessionEvent::TokenRefreshed { .. })));
    assert!(!events.iter().any(|e| matches!(
        e,
        SessionEvent::StateChanged {
            state: SessionState::Authenticated,
            ..
        }
    )));
}

#[tokio::test]
async fn test_login_then_bearer_on_authenticated_routes_only() {
    let server = MockServer::start().await;
    let token = mint_token("u7", 3600);

    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": token, "userID": "u7"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/projects"))
        .and(header("authorization", format!("Bearer {token}").as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": "P1", "name": "Apollo"}])))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let bus = SessionBus::default();
    let mut rx = bus.subscribe();
    let client = client_with(
        test_config(&server.uri(), DEAD_WS),
        Arc::new(MemoryStorage::new()),
        bus,
    );

    let user_id = client.login("ada@example.com", "hunter2").await.unwrap();
    assert_eq!(user_id, "u7");
    assert_eq!(client.state(), SessionState::Authenticated);

    let projects = client.projects().await.unwrap();
    assert_eq!(projects[0].name, "Apollo");
    // Second read served from the cache
    let again = client.projects().await.unwrap();
    assert_eq!(again.len(), 1);

    let events = drain(&mut rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::LoggedIn { user_id, .. } if user_id == "u7")));
}

#[tokio::test]
async fn test_failed_login_never_refreshes() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({"error": "bad credentials"})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let client = client_with(
        test_config(&server.uri(), DEAD_WS),
        Arc::new(MemoryStorage::new()),
        SessionBus::default(),
    );
    let err = client.login("ada@example.com", "wrong").await.unwrap_err();
    assert_eq!(err.status(), Some(401));
    assert_eq!(client.state(), SessionState::Unauthenticated);
}

#[tokio::test]
async fn test_logout_in_one_instance_reaches_the_other() {
    let server = MockServer::start().await;
    let token = mint_token("u1", 3600);

    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": token, "userID": "u1"})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/logout"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    // Two "tabs": one storage, one bus
    let storage: Arc<dyn Storage> = seeded_storage("u1", &token);
    let bus = SessionBus::default();
    let tab_a = client_with(test_config(&server.uri(), DEAD_WS), storage.clone(), bus.clone());
    let tab_b = client_with(test_config(&server.uri(), DEAD_WS), storage.clone(), bus.clone());

    assert_eq!(tab_a.initialize().await.unwrap(), SessionState::Authenticated);
    assert_eq!(tab_b.initialize().await.unwrap(), SessionState::Authenticated);

    let mut rx = bus.subscribe();
    tab_a.logout().await;
    assert_eq!(tab_a.state(), SessionState::Unauthenticated);

    assert!(eventually(Duration::from_secs(2), || tab_b.state() == SessionState::Unauthenticated).await);
    assert!(tab_b.session().is_deliberate_logout());
    assert!(tab_b.coordinator().get_token().is_none());

    tokio::time::sleep(Duration::from_millis(50)).await;
    // Only tab A broadcasts
    let events = drain(&mut rx);
    assert_eq!(logged_out_count(&events), 1);
}

#[tokio::test]
async fn test_logout_order_is_observable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/logout"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let bus = SessionBus::default();
    let client = client_with(
        test_config(&server.uri(), DEAD_WS),
        Arc::new(MemoryStorage::new()),
        bus.clone(),
    );
    let token = mint_token("u1", 3600);
    client
        .complete_oauth(&format!("https://app.example.com/auth/callback#token={token}&userID=u1"))
        .await
        .unwrap();
    client.cache().set(
        QueryKey::Projects {
            user_id: "u1".into(),
        },
        json!([]),
    );
    client.persist_cache().await.unwrap();

    let mut rx = bus.subscribe();
    client.logout().await;

    let events: Vec<SessionEvent> = drain(&mut rx)
        .into_iter()
        .filter(|e| e.origin() == client.session().origin())
        .collect();
    let flip = events
        .iter()
        .position(|e| matches!(e, SessionEvent::StateChanged { state: SessionState::Unauthenticated, .. }))
        .unwrap();
    let logged_out = events
        .iter()
        .position(|e| matches!(e, SessionEvent::LoggedOut { .. }))
        .unwrap();
    assert!(flip < logged_out);
    match &events[flip] {
        SessionEvent::StateChanged {
            deliberate_logout, ..
        } => assert!(deliberate_logout),
        _ => unreachable!(),
    }

    assert!(client.cache().is_empty());
    assert!(!client.cache().is_enabled());
    assert!(client.coordinator().get_token().is_none());
    let persisted = client.config().data_dir.join("cache-u1.json");
    assert!(!persisted.exists());
}

#[tokio::test]
async fn test_forbidden_query_drops_entry_and_scope_only() {
    let server = MockServer::start().await;
    let token = mint_token("u1", 3600);

    Mock::given(method("GET"))
        .and(path("/projects/P9/tasks"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({"error": "not a member"})))
        .mount(&server)
        .await;

    let bus = SessionBus::default();
    let mut rx = bus.subscribe();
    let client = client_with(
        test_config(&server.uri(), DEAD_WS),
        Arc::new(MemoryStorage::new()),
        bus,
    );
    client
        .complete_oauth(&format!("app://cb#token={token}&userID=u1"))
        .await
        .unwrap();
    client.select_project("P9").unwrap();

    let key = QueryKey::Tasks {
        project_id: "P9".into(),
    };
    let err = client.query(&key).await.unwrap_err();
    assert!(matches!(err, ClientError::Forbidden(_)));
    assert!(!client.cache().contains(&key));
    assert_eq!(client.selected_project(), None);
    assert_eq!(client.state(), SessionState::Authenticated);

    let events = drain(&mut rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::ScopeRevoked { project_id, .. } if project_id == "P9")));
    assert_eq!(logged_out_count(&events), 0);
}
