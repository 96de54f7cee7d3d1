use std::time::Duration;

use querycache::{Config, ObserverOptions, QueryOptions, Registry, RegistryError, fetch_fn};

use crate::{Outcome, TestFetcher, team, test, users_fetcher};

#[tokio::test(start_paused = true)]
async fn test_first_registration_wins() {
    test::setup();

    let registry = test::registry();
    let first = users_fetcher(Duration::from_secs(1));
    let second = users_fetcher(Duration::from_secs(1));

    let a = registry
        .get_or_create_query("users", first.clone(), QueryOptions::default())
        .unwrap();
    let b = registry
        .get_or_create_query(
            "users",
            second.clone(),
            QueryOptions {
                eviction_delay: None,
                ..Default::default()
            },
        )
        .unwrap();

    b.fetch(&team("core"), Duration::ZERO).await.unwrap();
    assert_eq!(first.calls(), 1);
    assert_eq!(second.calls(), 0);
    assert_eq!(a.entry_count(), 1);
    assert_eq!(b.options().eviction_delay, Some(Duration::from_secs(5 * 60)));
    assert_eq!(registry.query_names(), ["users"]);
}

#[tokio::test(start_paused = true)]
async fn test_conflicting_fetcher_type() {
    test::setup();

    let registry = test::registry();
    registry
        .get_or_create_query(
            "users",
            users_fetcher(Duration::from_secs(1)),
            QueryOptions::default(),
        )
        .unwrap();

    let counts = TestFetcher::<String, u32>::new(Duration::from_secs(1), |_, _| Outcome::Data(2));
    let err = registry
        .get_or_create_query("users", counts, QueryOptions::default())
        .unwrap_err();
    assert_eq!(
        err,
        RegistryError::TypeMismatch {
            name: "users".into()
        }
    );

    assert!(
        registry
            .query::<TestFetcher<String, u32>>("users")
            .is_err()
    );
    let users = registry
        .query::<TestFetcher<String, Vec<String>>>("users")
        .unwrap()
        .unwrap();
    assert_eq!(users.name(), "users");
    assert!(
        registry
            .query::<TestFetcher<String, u32>>("counts")
            .unwrap()
            .is_none()
    );
}

#[tokio::test(start_paused = true)]
async fn test_query_names_are_sorted() {
    test::setup();

    let registry = test::registry();
    for name in ["teams", "users", "projects"] {
        registry
            .get_or_create_query(
                name,
                users_fetcher(Duration::from_secs(1)),
                QueryOptions::default(),
            )
            .unwrap();
    }
    assert_eq!(registry.query_names(), ["projects", "teams", "users"]);
}

#[tokio::test(start_paused = true)]
async fn test_defaults_from_config() {
    test::setup();

    let yaml = r#"
        queries:
          eviction_delay: 10s
          freshness_window: 1m
    "#;
    let config = Config::from_reader(yaml.as_bytes()).unwrap();
    let registry = Registry::new(&config, tokio::runtime::Handle::current());
    assert_eq!(registry.defaults().freshness_window, Duration::from_secs(60));

    let squares = registry
        .get_or_create_query(
            "squares",
            fetch_fn(|n: u32| async move { anyhow::Ok(n * n) }),
            QueryOptions::from_config(registry.defaults()),
        )
        .unwrap();

    let observer = squares
        .observe(&3, ObserverOptions::from_config(registry.defaults()))
        .unwrap();
    assert_eq!(*observer.fetch().await.unwrap(), 9);

    tokio::time::advance(Duration::from_secs(30)).await;
    assert!(observer.is_fresh());

    drop(observer);
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(squares.entry_count(), 0);
}
