//! Remote instance resolution
//!
//! Instance metadata comes from the Mastodon-style `/api/v1/instance`
//! endpoint when the remote offers it, and from nodeinfo otherwise.

use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use url::Url;

use super::{Dereferencer, domain_of, handshake};
use crate::data::{EntityId, Instance};
use crate::error::{AppError, ErrorKind};
use crate::federation::objects::parse_iri;
use crate::metrics::observe_dereference;

const NODEINFO_SCHEMA_PREFIX: &str = "http://nodeinfo.diaspora.software/ns/schema/2.";

/// Metadata extracted from whichever endpoint answered
#[derive(Debug, Default, PartialEq)]
struct InstanceInfo {
    title: Option<String>,
    description: Option<String>,
    version: Option<String>,
    contact_email: Option<String>,
}

fn text(value: &Value, field: &str) -> Option<String> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn info_from_api(value: &Value) -> Result<InstanceInfo, AppError> {
    if !value.is_object() {
        return Err(AppError::Federation("instance API returned no object".to_string()));
    }
    Ok(InstanceInfo {
        title: text(value, "title"),
        description: text(value, "short_description").or_else(|| text(value, "description")),
        version: text(value, "version"),
        contact_email: text(value, "email").or_else(|| {
            value
                .get("contact")
                .and_then(|contact| text(contact, "email"))
        }),
    })
}

fn nodeinfo_href(value: &Value) -> Option<&str> {
    value
        .get("links")
        .and_then(Value::as_array)?
        .iter()
        .filter(|link| {
            link.get("rel")
                .and_then(Value::as_str)
                .is_some_and(|rel| rel.starts_with(NODEINFO_SCHEMA_PREFIX))
        })
        .filter_map(|link| link.get("href").and_then(Value::as_str))
        .last()
}

fn info_from_nodeinfo(value: &Value) -> InstanceInfo {
    let software = value.get("software");
    let version = software.and_then(|software| {
        match (text(software, "name"), text(software, "version")) {
            (Some(name), Some(version)) => Some(format!("{name} {version}")),
            (name, version) => name.or(version),
        }
    });
    let metadata = value.get("metadata");

    InstanceInfo {
        title: metadata.and_then(|m| text(m, "nodeName")),
        description: metadata.and_then(|m| text(m, "nodeDescription")),
        version,
        contact_email: None,
    }
}

impl Dereferencer {
    /// Resolve metadata of the instance serving `uri`
    ///
    /// Stored metadata younger than the instance refresh interval is
    /// returned without a fetch; a failed refresh falls back to stored
    /// metadata.
    pub async fn resolve_instance(&self, requester: &str, uri: &Url) -> Result<Instance, AppError> {
        self.inner.blocks.ensure_uri_allowed(uri).await?;

        let domain = domain_of(uri)?;
        if self.is_local_domain(&domain) {
            return Err(AppError::Validation(format!(
                "{domain} is this instance"
            )));
        }

        let existing = self.inner.db.get_instance(&domain).await?;
        if let Some(instance) = &existing {
            if instance.is_fresh(Utc::now(), self.inner.federation.instance_refresh_interval()) {
                observe_dereference("instance", "cached");
                return Ok(instance.clone());
            }
        }

        let this = self.clone();
        let owned_requester = requester.to_string();
        let origin = uri.origin().ascii_serialization();
        let key = domain.clone();
        let fetched = self
            .inner
            .instances
            .run(&key, move || {
                handshake::inherit(async move {
                    this.dereference_instance(&owned_requester, &domain, &origin)
                        .await
                })
                .boxed()
            })
            .await;

        match (fetched, existing) {
            (Ok(instance), _) => Ok(instance),
            (Err(error), Some(stale)) if error.kind() != ErrorKind::Blocked => {
                tracing::warn!(%error, domain = %stale.domain, "Instance refresh failed, using stored metadata");
                observe_dereference("instance", "stale");
                Ok(stale)
            }
            (Err(error), _) => Err(error),
        }
    }

    /// Resolve the instance of a newly seen account without waiting for it
    pub(super) fn resolve_instance_in_background(&self, requester: &str, uri: &Url) {
        let this = self.clone();
        let requester = requester.to_string();
        let uri = uri.clone();
        tokio::spawn(async move {
            let known = match domain_of(&uri) {
                Ok(domain) => this.inner.db.get_instance(&domain).await,
                Err(error) => Err(error),
            };
            if matches!(known, Ok(Some(_))) {
                return;
            }
            if let Err(error) = this.resolve_instance(&requester, &uri).await {
                tracing::warn!(%error, uri = %uri, "Failed to resolve instance of new account");
            }
        });
    }

    async fn dereference_instance(
        &self,
        requester: &str,
        domain: &str,
        origin: &str,
    ) -> Result<Instance, AppError> {
        let info = match self.instance_from_api(requester, origin).await {
            Ok(info) => info,
            Err(error) => {
                tracing::debug!(%error, domain, "Instance API unavailable, trying nodeinfo");
                match self.instance_from_nodeinfo(requester, domain, origin).await {
                    Ok(info) => info,
                    Err(error) => {
                        observe_dereference("instance", "failed");
                        return Err(error);
                    }
                }
            }
        };

        let now = Utc::now();
        let existing = self.inner.db.get_instance(domain).await?;
        let instance = Instance {
            id: existing
                .as_ref()
                .map(|instance| instance.id.clone())
                .unwrap_or_else(|| EntityId::new().0),
            domain: domain.to_string(),
            uri: origin.to_string(),
            title: info.title,
            description: info.description,
            version: info.version,
            contact_email: info.contact_email,
            created_at: existing.as_ref().map_or(now, |instance| instance.created_at),
            updated_at: now,
            fetched_at: now,
        };
        self.inner.db.upsert_instance(&instance).await?;

        observe_dereference("instance", "fetched");
        tracing::info!(domain, version = ?instance.version, "Dereferenced instance");

        Ok(self
            .inner
            .db
            .get_instance(domain)
            .await?
            .unwrap_or(instance))
    }

    async fn instance_from_api(&self, requester: &str, origin: &str) -> Result<InstanceInfo, AppError> {
        let url = parse_iri(&format!("{origin}/api/v1/instance"))?;
        let value = self.inner.transport.dereference(requester, &url).await?;
        info_from_api(&value)
    }

    async fn instance_from_nodeinfo(
        &self,
        requester: &str,
        domain: &str,
        origin: &str,
    ) -> Result<InstanceInfo, AppError> {
        let index_url = parse_iri(&format!("{origin}/.well-known/nodeinfo"))?;
        let index = self.inner.transport.dereference(requester, &index_url).await?;

        let href = nodeinfo_href(&index)
            .ok_or_else(|| AppError::Federation(format!("No nodeinfo 2.x link for {domain}")))?;
        let document_url = parse_iri(href)
            .map_err(|_| AppError::Federation(format!("Invalid nodeinfo link {href:?}")))?;
        if domain_of(&document_url)? != domain {
            return Err(AppError::Federation(format!(
                "Nodeinfo for {domain} points at another host: {document_url}"
            )));
        }

        let document = self.inner.transport.dereference(requester, &document_url).await?;
        Ok(info_from_nodeinfo(&document))
    }
}
