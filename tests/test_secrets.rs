mod utils;

use std::sync::Arc;

use anyhow::Result;
use secrecy::ExposeSecret;

use gordon::error::Error;
use gordon::secrets::{FileProvider, SecretProvider, SecretResolver, TokenStore};

#[tokio::test]
async fn file_provider_reads_and_confines_paths() -> Result<()> {
    let dir = tempfile::tempdir()?;
    std::fs::create_dir_all(dir.path().join("db"))?;
    std::fs::write(dir.path().join("db/password"), "hunter2\n")?;
    let provider = FileProvider::new(dir.path());

    assert!(provider.is_available().await);
    let secret = provider.get_secret("db/password").await?;
    assert_eq!(secret.expose_secret(), "hunter2");

    assert!(matches!(
        provider.get_secret("../outside").await,
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        provider.get_secret("db/missing").await,
        Err(Error::NotFound(_))
    ));
    Ok(())
}

#[tokio::test]
async fn resolver_expands_file_references_in_place() -> Result<()> {
    let dir = tempfile::tempdir()?;
    std::fs::write(dir.path().join("api-key"), "s3cr3t")?;
    let mut resolver = SecretResolver::new();
    resolver.register(Arc::new(FileProvider::new(dir.path())));

    let resolved = resolver.resolve("token=${file:api-key};rest").await?;
    assert_eq!(resolved, "token=s3cr3t;rest");
    Ok(())
}

#[tokio::test]
async fn token_store_round_trip() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = TokenStore::open(dir.path())?;

    let (token, secret) = store
        .save("ci", vec!["admin:routes:read".to_string()], Some(3600))
        .await?;
    assert_eq!(token.subject, "ci");
    assert!(!token.revoked);

    // The raw secret validates; the stored file holds only the hash.
    let validated = store.validate(secret.expose_secret())?;
    assert_eq!(validated.id, token.id);
    let on_disk = std::fs::read_to_string(
        dir.path()
            .join("secrets/gordon/registry/tokens/ci.json"),
    )?;
    assert!(!on_disk.contains(secret.expose_secret()));

    assert!(matches!(
        store.validate("not-a-real-token"),
        Err(Error::Unauthenticated(_))
    ));
    Ok(())
}

#[tokio::test]
async fn revocation_persists_across_reopen() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = TokenStore::open(dir.path())?;
    let (token, secret) = store.save("ci", vec!["admin:*".to_string()], None).await?;

    store.revoke(&token.id).await?;
    assert!(matches!(
        store.validate(secret.expose_secret()),
        Err(Error::Unauthenticated(_))
    ));
    assert!(store.get("ci")?.revoked);

    // A fresh store reads the revocation list back.
    let reopened = TokenStore::open(dir.path())?;
    assert!(matches!(
        reopened.validate(secret.expose_secret()),
        Err(Error::Unauthenticated(_))
    ));
    assert!(reopened.get("ci")?.revoked);
    Ok(())
}

#[tokio::test]
async fn expired_tokens_are_rejected() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = TokenStore::open(dir.path())?;
    let (_, secret) = store.save("ci", vec!["admin:*".to_string()], Some(-1)).await?;

    assert!(matches!(
        store.validate(secret.expose_secret()),
        Err(Error::Unauthenticated(_))
    ));
    Ok(())
}

#[tokio::test]
async fn reissuing_a_subject_invalidates_the_old_secret() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = TokenStore::open(dir.path())?;

    let (_, old_secret) = store.save("ci", vec!["admin:*".to_string()], None).await?;
    let (_, new_secret) = store.save("ci", vec!["admin:*".to_string()], None).await?;

    assert!(store.validate(old_secret.expose_secret()).is_err());
    assert!(store.validate(new_secret.expose_secret()).is_ok());
    Ok(())
}

#[tokio::test]
async fn delete_removes_token_and_file() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = TokenStore::open(dir.path())?;
    let (_, secret) = store.save("ci", vec!["admin:*".to_string()], None).await?;

    store.delete("ci").await?;
    assert!(store.validate(secret.expose_secret()).is_err());
    assert!(store.list().is_empty());
    assert!(!dir
        .path()
        .join("secrets/gordon/registry/tokens/ci.json")
        .exists());
    Ok(())
}
