use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs;
use tokio::sync::RwLock;

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::events::{Event, EventBus};
use crate::models::{Attachment, ExternalRoute, Route};

/// Owner of the route table, external routes and attachments.
///
/// Mutations take the single write lock, persist the file atomically while
/// still holding it (total order), and publish their event after release.
/// Readers get copies.
pub struct ConfigService {
    path: PathBuf,
    events: Arc<EventBus>,
    state: RwLock<Settings>,
}

impl ConfigService {
    pub fn new<P: AsRef<Path>>(path: P, settings: Settings, events: Arc<EventBus>) -> ConfigService {
        ConfigService {
            path: path.as_ref().to_path_buf(),
            events,
            state: RwLock::new(settings),
        }
    }

    pub async fn settings(&self) -> Settings {
        self.state.read().await.clone()
    }

    pub async fn get_routes(&self) -> Vec<Route> {
        self.state.read().await.routes.clone()
    }

    pub async fn get_route(&self, domain: &str) -> Result<Route> {
        self.state
            .read()
            .await
            .routes
            .iter()
            .find(|r| r.domain == domain)
            .cloned()
            .ok_or_else(|| Error::RouteNotFound {
                domain: domain.to_string(),
            })
    }

    /// Route whose image matches the pushed repository and tag, if any.
    pub async fn route_for_image(&self, repository: &str, reference: &str) -> Option<Route> {
        use crate::models::reference::ImageReference;
        let state = self.state.read().await;
        state
            .routes
            .iter()
            .find(|route| {
                let Ok(parsed) = ImageReference::parse(&route.image) else {
                    return false;
                };
                parsed.short_name() == repository
                    && parsed.tag().map_or(true, |tag| tag == reference)
            })
            .cloned()
    }

    pub async fn add_route(&self, route: Route) -> Result<()> {
        route.validate()?;
        {
            let mut state = self.state.write().await;
            if state.routes.iter().any(|r| r.domain == route.domain) {
                return Err(Error::RouteExists {
                    domain: route.domain,
                });
            }
            if state.external_routes.contains_key(&route.domain) {
                return Err(Error::AlreadyExists(format!(
                    "{} is already an external route",
                    route.domain
                )));
            }
            state.routes.push(route.clone());
            self.persist(&state).await?;
        }
        self.events.publish(Event::RouteAdded {
            domain: route.domain,
        });
        Ok(())
    }

    pub async fn update_route(&self, route: Route) -> Result<()> {
        route.validate()?;
        {
            let mut state = self.state.write().await;
            let existing = state
                .routes
                .iter_mut()
                .find(|r| r.domain == route.domain)
                .ok_or_else(|| Error::RouteNotFound {
                    domain: route.domain.clone(),
                })?;
            *existing = route.clone();
            self.persist(&state).await?;
        }
        self.events.publish(Event::RouteAdded {
            domain: route.domain,
        });
        Ok(())
    }

    pub async fn remove_route(&self, domain: &str) -> Result<Route> {
        let removed = {
            let mut state = self.state.write().await;
            let idx = state
                .routes
                .iter()
                .position(|r| r.domain == domain)
                .ok_or_else(|| Error::RouteNotFound {
                    domain: domain.to_string(),
                })?;
            let removed = state.routes.remove(idx);
            self.persist(&state).await?;
            removed
        };
        self.events.publish(Event::RouteRemoved {
            domain: domain.to_string(),
        });
        Ok(removed)
    }

    pub async fn external_routes(&self) -> Vec<ExternalRoute> {
        self.state.read().await.external_routes()
    }

    pub async fn get_external_route(&self, domain: &str) -> Option<ExternalRoute> {
        let state = self.state.read().await;
        state
            .external_routes
            .get(domain)
            .and_then(|target| ExternalRoute::parse(domain, target).ok())
    }

    pub async fn add_attachment(&self, attachment: Attachment) -> Result<()> {
        attachment.validate()?;
        let mut state = self.state.write().await;
        let images = state.attachments.entry(attachment.target.clone()).or_default();
        if images.contains(&attachment.image) {
            return Err(Error::AttachmentExists {
                target: attachment.target,
                image: attachment.image,
            });
        }
        images.push(attachment.image);
        self.persist(&state).await
    }

    pub async fn remove_attachment(&self, attachment: &Attachment) -> Result<()> {
        let mut state = self.state.write().await;
        let images = state
            .attachments
            .get_mut(&attachment.target)
            .ok_or_else(|| Error::AttachmentNotFound {
                target: attachment.target.clone(),
                image: attachment.image.clone(),
            })?;
        let idx = images
            .iter()
            .position(|i| i == &attachment.image)
            .ok_or_else(|| Error::AttachmentNotFound {
                target: attachment.target.clone(),
                image: attachment.image.clone(),
            })?;
        images.remove(idx);
        if images.is_empty() {
            state.attachments.remove(&attachment.target);
        }
        self.persist(&state).await
    }

    pub async fn attachments(&self) -> BTreeMap<String, Vec<String>> {
        self.state.read().await.attachments.clone()
    }

    pub async fn attachments_for(&self, target: &str) -> Vec<Attachment> {
        self.state
            .read()
            .await
            .attachments
            .get(target)
            .map(|images| {
                images
                    .iter()
                    .map(|image| Attachment {
                        target: target.to_string(),
                        image: image.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Re-reads the file and replaces the in-memory state wholesale. A file
    /// that fails to parse or validate leaves the current state untouched.
    pub async fn reload(&self) -> Result<()> {
        let loaded = Settings::load(&self.path)?;
        {
            let mut state = self.state.write().await;
            *state = loaded;
        }
        self.events.publish(Event::ConfigReload);
        tracing::info!("configuration reloaded");
        Ok(())
    }

    pub async fn to_toml(&self) -> Result<String> {
        self.state.read().await.to_toml()
    }

    /// Write-back with temp file plus rename; called under the write lock.
    async fn persist(&self, settings: &Settings) -> Result<()> {
        let serialized = settings.to_toml()?;
        let tmp = self.path.with_extension("toml.tmp");
        fs::write(&tmp, serialized.as_bytes()).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
