//! nswatch kubehub: watch transport over the API server's raw watch endpoint
//! and shaping of watched objects into `ResourceView`s.

#![forbid(unsafe_code)]

use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use kube::{
    api::{Api, WatchEvent, WatchParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use metrics::histogram;
use nswatch_core::{RawNotification, RawStream, ResourceView, Transformer, WatchError, WatchTransport};
use smallvec::SmallVec;
use tracing::{debug, info};
use uuid::Uuid;

/// Server-side watch timeout. The server closes the stream after this, which
/// the aggregator treats like any other end of stream.
pub const DEFAULT_WATCH_TIMEOUT_SECS: u32 = 290;

fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => {
            Ok(GroupVersionKind { group: String::new(), version: version.to_string(), kind: kind.to_string() })
        }
        [group, version, kind] if !version.is_empty() && !kind.is_empty() => {
            Ok(GroupVersionKind { group: (*group).to_string(), version: (*version).to_string(), kind: (*kind).to_string() })
        }
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

/// Watches one resource kind, one subscription per namespace.
#[derive(Clone)]
pub struct KubeTransport {
    client: Client,
    gvk_key: String,
    ar: ApiResource,
    namespaced: bool,
}

impl KubeTransport {
    /// Resolve `gvk_key` (e.g. `v1/Pod`, `apps/v1/Deployment`) against the
    /// current kube context.
    pub async fn for_gvk(gvk_key: &str) -> Result<Self> {
        let client = Client::try_default().await.context("building kube client")?;
        Self::with_client(client, gvk_key).await
    }

    pub async fn with_client(client: Client, gvk_key: &str) -> Result<Self> {
        let t0 = Instant::now();
        let gvk = parse_gvk_key(gvk_key)?;
        let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;
        info!(gvk = %gvk_key, namespaced, took_ms = %t0.elapsed().as_millis(), "kube transport ready");
        Ok(Self { client, gvk_key: gvk_key.to_string(), ar, namespaced })
    }

    pub fn namespaced(&self) -> bool {
        self.namespaced
    }

    fn api(&self, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) if self.namespaced => Api::namespaced_with(self.client.clone(), ns, &self.ar),
            _ => Api::all_with(self.client.clone(), &self.ar),
        }
    }
}

#[async_trait::async_trait]
impl WatchTransport for KubeTransport {
    async fn subscribe(&self, namespace: Option<&str>) -> Result<RawStream, WatchError> {
        let t0 = Instant::now();
        if namespace.is_some() && !self.namespaced {
            debug!(gvk = %self.gvk_key, ns = ?namespace, "cluster-scoped kind; watching unscoped");
        }
        let wp = WatchParams::default().timeout(DEFAULT_WATCH_TIMEOUT_SECS);
        // "0": start from any cached state; existing objects arrive as ADDED.
        let stream = self.api(namespace).watch(&wp, "0").await.map_err(WatchError::transport)?;
        histogram!("kube_watch_subscribe_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(gvk = %self.gvk_key, ns = ?namespace, took_ms = %t0.elapsed().as_millis(), "kube watch opened");
        Ok(stream
            .map(|item| match item {
                Ok(ev) => raw_from_watch_event(ev),
                Err(e) => Err(WatchError::transport(e)),
            })
            .boxed())
    }
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

fn object_json(obj: &DynamicObject) -> Result<serde_json::Value> {
    let mut raw = serde_json::to_value(obj).context("serializing DynamicObject")?;
    strip_managed_fields(&mut raw);
    Ok(raw)
}

/// Flatten a typed watch event back into the raw (type, object) pair. Server
/// side `ERROR` events and objects that cannot be serialized end the
/// subscription.
fn raw_from_watch_event(ev: WatchEvent<DynamicObject>) -> Result<RawNotification, WatchError> {
    let as_raw = |o: &DynamicObject| object_json(o).map_err(|e| WatchError::Transport(format!("{e:#}")));
    let (kind, object) = match ev {
        WatchEvent::Added(o) => ("ADDED", as_raw(&o)?),
        WatchEvent::Modified(o) => ("MODIFIED", as_raw(&o)?),
        WatchEvent::Deleted(o) => ("DELETED", as_raw(&o)?),
        WatchEvent::Bookmark(b) => (
            "BOOKMARK",
            serde_json::json!({ "metadata": { "resourceVersion": b.metadata.resource_version } }),
        ),
        WatchEvent::Error(e) => {
            return Err(WatchError::Transport(format!("watch error {} {}: {}", e.code, e.reason, e.message)));
        }
    };
    Ok(RawNotification { kind: kind.to_string(), object })
}

fn to_uid(uid_str: &str) -> Result<nswatch_core::Uid> {
    let u = Uuid::parse_str(uid_str).context("parsing metadata.uid as uuid")?;
    Ok(*u.as_bytes())
}

/// Shapes raw objects into [`ResourceView`]s.
#[derive(Debug, Clone, Default)]
pub struct ResourceTransformer {
    /// Keep at most this many labels per object.
    pub max_labels: Option<usize>,
}

impl Transformer<ResourceView> for ResourceTransformer {
    fn transform(&self, raw: &serde_json::Value) -> Result<ResourceView> {
        let meta = raw.get("metadata").and_then(|m| m.as_object()).ok_or_else(|| anyhow!("object missing metadata"))?;
        let uid_str = meta.get("uid").and_then(|v| v.as_str()).ok_or_else(|| anyhow!("object missing metadata.uid"))?;
        let uid = to_uid(uid_str)?;
        let name = meta.get("name").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let namespace = meta.get("namespace").and_then(|v| v.as_str()).map(|s| s.to_string());
        let resource_version = meta.get("resourceVersion").and_then(|v| v.as_str()).map(|s| s.to_string());
        let creation_ts = meta
            .get("creationTimestamp")
            .and_then(|v| v.as_str())
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.timestamp())
            .unwrap_or(0);
        let mut labels = SmallVec::<[(String, String); 8]>::new();
        if let Some(lbls) = meta.get("labels").and_then(|m| m.as_object()) {
            for (k, v) in lbls.iter() {
                if let Some(cap) = self.max_labels {
                    if labels.len() >= cap {
                        break;
                    }
                }
                if let Some(val) = v.as_str() {
                    labels.push((k.clone(), val.to_string()));
                }
            }
        }
        Ok(ResourceView { uid, namespace, name, resource_version, creation_ts, labels })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UID: &str = "6b1f2c1e-8a34-4c57-9a55-0d7d1e0f9a01";

    fn config_map(name: &str) -> serde_json::Value {
        serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": name,
                "namespace": "team-a",
                "uid": UID,
                "resourceVersion": "42",
                "creationTimestamp": "2020-01-01T00:00:10Z",
                "labels": { "app": "web", "tier": "frontend" },
                "managedFields": [{ "manager": "kubectl" }]
            },
            "data": { "k": "v" }
        })
    }

    fn dynamic(name: &str) -> DynamicObject {
        serde_json::from_value(config_map(name)).expect("valid DynamicObject")
    }

    #[test]
    fn parse_gvk_key_accepts_core_and_grouped() {
        let core = parse_gvk_key("v1/ConfigMap").expect("ok");
        assert_eq!((core.group.as_str(), core.version.as_str(), core.kind.as_str()), ("", "v1", "ConfigMap"));
        let apps = parse_gvk_key("apps/v1/Deployment").expect("ok");
        assert_eq!((apps.group.as_str(), apps.version.as_str(), apps.kind.as_str()), ("apps", "v1", "Deployment"));
    }

    #[test]
    fn parse_gvk_key_rejects_malformed() {
        assert!(parse_gvk_key("ConfigMap").is_err());
        assert!(parse_gvk_key("").is_err());
        assert!(parse_gvk_key("a/b/c/d").is_err());
        assert!(parse_gvk_key("v1/").is_err());
    }

    #[test]
    fn watch_events_map_to_raw_kinds() {
        let added = raw_from_watch_event(WatchEvent::Added(dynamic("a"))).expect("added");
        assert_eq!(added.kind, "ADDED");
        assert_eq!(added.object["metadata"]["name"], "a");
        assert!(added.object["metadata"].get("managedFields").is_none());

        let modified = raw_from_watch_event(WatchEvent::Modified(dynamic("a"))).expect("modified");
        assert_eq!(modified.kind, "MODIFIED");
        let deleted = raw_from_watch_event(WatchEvent::Deleted(dynamic("a"))).expect("deleted");
        assert_eq!(deleted.kind, "DELETED");
    }

    #[test]
    fn object_json_keeps_payload_and_drops_managed_fields() {
        let raw = object_json(&dynamic("a")).expect("serializable");
        assert_eq!(raw["data"]["k"], "v");
        assert_eq!(raw["metadata"]["labels"]["app"], "web");
        assert!(raw["metadata"].get("managedFields").is_none());
    }

    #[test]
    fn server_error_event_is_a_transport_failure() {
        let err = raw_from_watch_event(WatchEvent::Error(kube::core::ErrorResponse {
            status: "Failure".into(),
            message: "too old resource version".into(),
            reason: "Expired".into(),
            code: 410,
        }))
        .unwrap_err();
        assert!(err.is_terminal());
        assert!(err.to_string().contains("410"));
    }

    #[test]
    fn transformer_shapes_metadata() {
        let view = ResourceTransformer::default().transform(&config_map("web-config")).expect("shaped");
        assert_eq!(view.uid, *Uuid::parse_str(UID).expect("uuid").as_bytes());
        assert_eq!(view.name, "web-config");
        assert_eq!(view.namespace.as_deref(), Some("team-a"));
        assert_eq!(view.resource_version.as_deref(), Some("42"));
        assert_eq!(view.creation_ts, 1_577_836_810);
        assert_eq!(view.labels.len(), 2);
    }

    #[test]
    fn transformer_caps_labels() {
        let view = ResourceTransformer { max_labels: Some(1) }.transform(&config_map("x")).expect("shaped");
        assert_eq!(view.labels.len(), 1);
    }

    #[test]
    fn transformer_rejects_objects_without_uid() {
        let t = ResourceTransformer::default();
        assert!(t.transform(&serde_json::json!({ "metadata": { "name": "x" } })).is_err());
        assert!(t.transform(&serde_json::json!({ "metadata": { "name": "x", "uid": "not-a-uuid" } })).is_err());
        assert!(t.transform(&serde_json::Value::Null).is_err());
    }
}
