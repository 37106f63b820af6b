use pgwarden::WardenError;

fn init_env() {
    unsafe {
        std::env::set_var("DIRECT_URL", "this is not a connection string");
    }
}

#[tokio::test]
async fn malformed_url_surfaces_driver_error_on_every_call() {
    init_env();

    for _ in 0..2 {
        let err = pgwarden::db::client().await.unwrap_err();
        assert!(
            matches!(err, WardenError::Database(sqlx::Error::Configuration(_))),
            "unexpected error: {err:?}"
        );
    }

    let err = pgwarden::db::enhanced_client().await.unwrap_err();
    assert!(matches!(err, WardenError::Database(_)));

    // Nothing was built, so shutdown has nothing to close.
    pgwarden::db::shutdown().await;
}
