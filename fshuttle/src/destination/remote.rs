use super::{IntegrationDestination, mode_for, surrogate_id};
use crate::errors::{Result, ShuttleError};
use crate::models::{
    Association, Entity, EntityKey, PropertyValues, StorageDestination, UpdateMode,
};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use url::Url;
use uuid::Uuid;

#[derive(Debug, Serialize, PartialEq)]
pub(crate) struct EntityRef {
    entity_set_id: Uuid,
    id: Uuid,
}

#[derive(Debug, Serialize, PartialEq)]
pub(crate) struct AssociationPayload {
    edge: EntityRef,
    src: EntityRef,
    dst: EntityRef,
    properties: Map<String, Value>,
}

/// Sends entities and associations to a remote data API as JSON.
///
/// Entities go to `POST {base}/data/{entity set id}?type={update mode}` with a
/// body of `{id: {property type id: [values]}}`; associations go to
/// `POST {base}/data/association`.
pub struct RemoteApiDestination {
    base_url: Url,
    token: Option<String>,
    client: reqwest::Client,
}

impl RemoteApiDestination {
    pub fn new(base_url: Url, token: Option<String>) -> Self {
        Self {
            base_url,
            token,
            client: reqwest::Client::new(),
        }
    }

    pub(crate) fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                ShuttleError::Config(format!("remote API url '{}' cannot be a base", self.base_url))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn post<T: Serialize + Sync>(&self, url: Url, body: &T) -> Result<()> {
        let mut request = self.client.post(url.clone()).json(body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ShuttleError::RemoteApi(format!(
                "{} returned {}: {}",
                url, status, error_body
            )));
        }
        Ok(())
    }
}

fn properties_json(properties: &PropertyValues) -> Map<String, Value> {
    let mut sorted: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    for (property_type_id, values) in properties {
        let mut values: Vec<_> = values.iter().collect();
        values.sort_by_key(|v| v.canonical_text());
        sorted.insert(
            property_type_id.to_string(),
            values.into_iter().map(|v| v.to_json()).collect(),
        );
    }
    sorted
        .into_iter()
        .map(|(k, v)| (k, Value::Array(v)))
        .collect()
}

/// Entity bodies grouped by entity set.
pub(crate) fn entity_payloads(
    entities: &HashMap<EntityKey, Entity>,
    ids: &HashMap<EntityKey, Uuid>,
) -> Result<BTreeMap<Uuid, Map<String, Value>>> {
    let mut payloads: BTreeMap<Uuid, Map<String, Value>> = BTreeMap::new();
    for (key, entity) in entities {
        let id = surrogate_id(ids, key)?;
        payloads
            .entry(key.entity_set_id)
            .or_default()
            .insert(id.to_string(), Value::Object(properties_json(&entity.properties)));
    }
    Ok(payloads)
}

pub(crate) fn association_payload(
    associations: &HashMap<EntityKey, Association>,
    ids: &HashMap<EntityKey, Uuid>,
) -> Result<Vec<AssociationPayload>> {
    let reference = |key: &EntityKey| -> Result<EntityRef> {
        Ok(EntityRef {
            entity_set_id: key.entity_set_id,
            id: surrogate_id(ids, key)?,
        })
    };
    let mut keys: Vec<&EntityKey> = associations.keys().collect();
    keys.sort();

    let mut payload = Vec::with_capacity(keys.len());
    for key in keys {
        let association = &associations[key];
        payload.push(AssociationPayload {
            edge: reference(key)?,
            src: reference(&association.src)?,
            dst: reference(&association.dst)?,
            properties: properties_json(&association.properties),
        });
    }
    Ok(payload)
}

#[async_trait]
impl IntegrationDestination for RemoteApiDestination {
    fn accepts(&self) -> StorageDestination {
        StorageDestination::RemoteApi
    }

    async fn integrate_entities(
        &self,
        entities: &HashMap<EntityKey, Entity>,
        ids: &HashMap<EntityKey, Uuid>,
        update_modes: &HashMap<Uuid, UpdateMode>,
    ) -> Result<usize> {
        let payloads = entity_payloads(entities, ids)?;
        let mut written = 0;
        for (entity_set_id, body) in &payloads {
            let mut url = self.endpoint(&["data", &entity_set_id.to_string()])?;
            url.query_pairs_mut()
                .append_pair("type", mode_for(update_modes, entity_set_id).as_str());
            self.post(url, body).await?;
            written += body.len();
            log::info!(
                "Remote API: sent {} entities of entity set {}",
                body.len(),
                entity_set_id
            );
        }
        Ok(written)
    }

    async fn integrate_associations(
        &self,
        associations: &HashMap<EntityKey, Association>,
        ids: &HashMap<EntityKey, Uuid>,
        _update_modes: &HashMap<Uuid, UpdateMode>,
    ) -> Result<usize> {
        if associations.is_empty() {
            return Ok(0);
        }
        let payload = association_payload(associations, ids)?;
        self.post(self.endpoint(&["data", "association"])?, &payload)
            .await?;
        log::info!("Remote API: sent {} associations", payload.len());
        Ok(payload.len())
    }
}
