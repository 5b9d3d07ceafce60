//! Typed map over a [`SortedMapProvider`].
//!
//! Keys and values are converted with [`Codec`] strategy values chosen at
//! construction. Each capability is its own trait so callers can depend on
//! only what they use.

use crate::codec::Codec;
use crate::error::StoreResult;
use crate::notify::ChangeEvent;
use crate::provider::{CallOptions, EnumerationOptions, RemoveSummary, SortedMapProvider};
use crate::types::{GroupId, SequenceNumber};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Decoded change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapChange<K, V> {
    Added { key: K, value: V },
    Updated { key: K, old_value: Option<V>, new_value: V },
    Removed { key: K, old_value: Option<V> },
    Cleared,
}

#[async_trait]
pub trait MapRead<K, V> {
    async fn get(&self, key: &K, opts: &CallOptions) -> StoreResult<Option<V>>;

    async fn contains_key(&self, key: &K, opts: &CallOptions) -> StoreResult<bool>;

    async fn count(&self) -> StoreResult<u64>;

    /// Collect every pair the enumeration yields, in key order.
    async fn range(&self, opts: EnumerationOptions) -> StoreResult<Vec<(K, V)>>;
}

#[async_trait]
pub trait MapWrite<K, V> {
    async fn add(&self, key: &K, value: &V, opts: &CallOptions) -> StoreResult<()>;

    async fn try_add(&self, key: &K, value: &V, opts: &CallOptions) -> StoreResult<bool>;

    async fn remove(&self, key: &K, opts: &CallOptions) -> StoreResult<Option<V>>;

    async fn update(&self, key: &K, value: &V, opts: &CallOptions) -> StoreResult<V>;

    async fn try_update(&self, key: &K, value: &V, expected: &V, opts: &CallOptions) -> StoreResult<bool>;

    async fn add_or_update(&self, key: &K, value: &V, opts: &CallOptions) -> StoreResult<Option<V>>;

    async fn get_or_add(&self, key: &K, value: &V, opts: &CallOptions) -> StoreResult<V>;

    async fn add_all(&self, items: &[(K, V)], opts: &CallOptions) -> StoreResult<()>;

    async fn remove_all(&self, keys: &[K], opts: &CallOptions) -> StoreResult<RemoveSummary>;

    /// Update `keys[i]` to `values[i]`, all or nothing.
    async fn update_all(&self, keys: &[K], values: &[V], opts: &CallOptions) -> StoreResult<()>;

    /// Move the value under `existing` to `new_key`, or store `value` there
    /// when given. False if `existing` is absent.
    async fn replace(&self, existing: &K, new_key: &K, value: Option<&V>, opts: &CallOptions) -> StoreResult<bool>;

    async fn clear(&self, opts: &CallOptions) -> StoreResult<()>;
}

#[async_trait]
pub trait AtomicGroups {
    async fn begin(&self, cancel: &CancellationToken) -> StoreResult<GroupId>;

    async fn commit(&self, group: GroupId, cancel: &CancellationToken) -> StoreResult<SequenceNumber>;

    async fn rollback(&self, group: GroupId, cancel: &CancellationToken) -> StoreResult<()>;
}

pub trait ChangeSource<K, V> {
    /// Observe committed changes. Events that fail to decode are logged and
    /// skipped.
    fn on_change<F>(&self, observer: F)
    where
        F: Fn(MapChange<K, V>) -> anyhow::Result<()> + Send + Sync + 'static;
}

pub struct ReplicatedMap<K, V> {
    provider: Arc<SortedMapProvider>,
    keys: Codec<K>,
    values: Codec<V>,
}

impl<K, V> ReplicatedMap<K, V> {
    pub fn new(provider: Arc<SortedMapProvider>, keys: Codec<K>, values: Codec<V>) -> Self {
        Self {
            provider,
            keys,
            values,
        }
    }

    pub fn provider(&self) -> &Arc<SortedMapProvider> {
        &self.provider
    }

    fn decode_opt(&self, value: Option<bytes::Bytes>) -> StoreResult<Option<V>> {
        value.map(|v| self.values.decode(&v)).transpose()
    }
}

fn decode_change<K, V>(keys: Codec<K>, values: Codec<V>, event: &ChangeEvent) -> StoreResult<MapChange<K, V>> {
    let opt = |v: &Option<bytes::Bytes>| v.as_ref().map(|v| values.decode(v)).transpose();
    Ok(match event {
        ChangeEvent::Added { key, value } => MapChange::Added {
            key: keys.decode(key)?,
            value: values.decode(value)?,
        },
        ChangeEvent::Updated {
            key,
            old_value,
            new_value,
        } => MapChange::Updated {
            key: keys.decode(key)?,
            old_value: opt(old_value)?,
            new_value: values.decode(new_value)?,
        },
        ChangeEvent::Removed { key, old_value } => MapChange::Removed {
            key: keys.decode(key)?,
            old_value: opt(old_value)?,
        },
        ChangeEvent::Cleared => MapChange::Cleared,
    })
}

#[async_trait]
impl<K, V> MapRead<K, V> for ReplicatedMap<K, V>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    async fn get(&self, key: &K, opts: &CallOptions) -> StoreResult<Option<V>> {
        let key = self.keys.encode(key)?;
        let value = self.provider.get(&key, opts).await?;
        self.decode_opt(value)
    }

    async fn contains_key(&self, key: &K, opts: &CallOptions) -> StoreResult<bool> {
        let key = self.keys.encode(key)?;
        self.provider.contains_key(&key, opts).await
    }

    async fn count(&self) -> StoreResult<u64> {
        self.provider.count().await
    }

    async fn range(&self, opts: EnumerationOptions) -> StoreResult<Vec<(K, V)>> {
        let mut enumerator = self.provider.create_enumerator(opts).await?;
        let mut out = Vec::new();
        while let Some((key, value)) = enumerator.next().await? {
            out.push((self.keys.decode(&key)?, self.values.decode(&value)?));
        }
        enumerator.close();
        Ok(out)
    }
}

#[async_trait]
impl<K, V> MapWrite<K, V> for ReplicatedMap<K, V>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    async fn add(&self, key: &K, value: &V, opts: &CallOptions) -> StoreResult<()> {
        let (key, value) = (self.keys.encode(key)?, self.values.encode(value)?);
        self.provider.add(&key, &value, opts).await
    }

    async fn try_add(&self, key: &K, value: &V, opts: &CallOptions) -> StoreResult<bool> {
        let (key, value) = (self.keys.encode(key)?, self.values.encode(value)?);
        self.provider.try_add(&key, &value, opts).await
    }

    async fn remove(&self, key: &K, opts: &CallOptions) -> StoreResult<Option<V>> {
        let key = self.keys.encode(key)?;
        let removed = self.provider.remove(&key, opts).await?;
        self.decode_opt(removed)
    }

    async fn update(&self, key: &K, value: &V, opts: &CallOptions) -> StoreResult<V> {
        let (key, value) = (self.keys.encode(key)?, self.values.encode(value)?);
        let prior = self.provider.update(&key, &value, opts).await?;
        self.values.decode(&prior)
    }

    async fn try_update(&self, key: &K, value: &V, expected: &V, opts: &CallOptions) -> StoreResult<bool> {
        let key = self.keys.encode(key)?;
        let (value, expected) = (self.values.encode(value)?, self.values.encode(expected)?);
        self.provider.try_update(&key, &value, &expected, opts).await
    }

    async fn add_or_update(&self, key: &K, value: &V, opts: &CallOptions) -> StoreResult<Option<V>> {
        let (key, value) = (self.keys.encode(key)?, self.values.encode(value)?);
        let prior = self.provider.add_or_update(&key, &value, opts).await?;
        self.decode_opt(prior)
    }

    async fn get_or_add(&self, key: &K, value: &V, opts: &CallOptions) -> StoreResult<V> {
        let (key, value) = (self.keys.encode(key)?, self.values.encode(value)?);
        let current = self.provider.get_or_add(&key, &value, opts).await?;
        self.values.decode(&current)
    }

    async fn add_all(&self, items: &[(K, V)], opts: &CallOptions) -> StoreResult<()> {
        let encoded = items
            .iter()
            .map(|(k, v)| Ok((self.keys.encode(k)?, self.values.encode(v)?)))
            .collect::<StoreResult<Vec<_>>>()?;
        self.provider.add_all(&encoded, opts).await
    }

    async fn remove_all(&self, keys: &[K], opts: &CallOptions) -> StoreResult<RemoveSummary> {
        let encoded = keys
            .iter()
            .map(|k| self.keys.encode(k))
            .collect::<StoreResult<Vec<_>>>()?;
        self.provider.remove_all(&encoded, opts).await
    }

    async fn update_all(&self, keys: &[K], values: &[V], opts: &CallOptions) -> StoreResult<()> {
        let keys = keys
            .iter()
            .map(|k| self.keys.encode(k))
            .collect::<StoreResult<Vec<_>>>()?;
        let values = values
            .iter()
            .map(|v| self.values.encode(v))
            .collect::<StoreResult<Vec<_>>>()?;
        self.provider.update_all(&keys, &values, opts).await
    }

    async fn replace(&self, existing: &K, new_key: &K, value: Option<&V>, opts: &CallOptions) -> StoreResult<bool> {
        let (existing, new_key) = (self.keys.encode(existing)?, self.keys.encode(new_key)?);
        let value = value.map(|v| self.values.encode(v)).transpose()?;
        self.provider
            .replace(&existing, &new_key, value.as_ref(), opts)
            .await
    }

    async fn clear(&self, opts: &CallOptions) -> StoreResult<()> {
        self.provider.clear(opts).await
    }
}

#[async_trait]
impl<K, V> AtomicGroups for ReplicatedMap<K, V>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    async fn begin(&self, cancel: &CancellationToken) -> StoreResult<GroupId> {
        self.provider.create_group(cancel).await
    }

    async fn commit(&self, group: GroupId, cancel: &CancellationToken) -> StoreResult<SequenceNumber> {
        self.provider.commit_group(group, cancel).await
    }

    async fn rollback(&self, group: GroupId, cancel: &CancellationToken) -> StoreResult<()> {
        self.provider.rollback_group(group, cancel).await
    }
}

impl<K, V> ChangeSource<K, V> for ReplicatedMap<K, V>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn on_change<F>(&self, observer: F)
    where
        F: Fn(MapChange<K, V>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let (keys, values) = (self.keys, self.values);
        self.provider
            .subscribe(Arc::new(move |event: &ChangeEvent| -> anyhow::Result<()> {
                match decode_change(keys, values, event) {
                    Ok(change) => observer(change),
                    Err(e) => {
                        tracing::warn!(error = %e, "undecodable change event skipped");
                        Ok(())
                    }
                }
            }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderConfig;
    use crate::provider::LocalReplica;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    async fn map() -> ReplicatedMap<String, u64> {
        let replica = LocalReplica::start_primary(ProviderConfig::default()).await.unwrap();
        ReplicatedMap::new(replica.provider, Codec::<String>::utf8(), Codec::<u64>::bincode())
    }

    #[tokio::test]
    async fn typed_round_trip_through_the_provider() {
        let map = map().await;
        let opts = CallOptions::default();
        map.add(&"apples".to_string(), &3, &opts).await.unwrap();

        assert_eq!(map.get(&"apples".to_string(), &opts).await.unwrap(), Some(3));
        assert_eq!(map.update(&"apples".to_string(), &5, &opts).await.unwrap(), 3);
        assert_eq!(map.get_or_add(&"pears".to_string(), &1, &opts).await.unwrap(), 1);
        assert!(map.try_update(&"pears".to_string(), &2, &1, &opts).await.unwrap());
        assert_eq!(map.count().await.unwrap(), 2);
        assert_eq!(map.remove(&"apples".to_string(), &opts).await.unwrap(), Some(5));
    }

    #[tokio::test]
    async fn empty_string_is_a_valid_key() {
        let map = map().await;
        let opts = CallOptions::default();
        map.add(&String::new(), &1, &opts).await.unwrap();
        map.add(&"b".to_string(), &2, &opts).await.unwrap();

        assert_eq!(map.get(&String::new(), &opts).await.unwrap(), Some(1));
        let pairs = map.range(EnumerationOptions::default()).await.unwrap();
        assert_eq!(pairs, vec![(String::new(), 1), ("b".to_string(), 2)]);
    }

    #[tokio::test]
    async fn bulk_update_and_replace_through_the_facade() {
        let map = map().await;
        let opts = CallOptions::default();
        map.add_all(&[("a".to_string(), 1), ("b".to_string(), 2)], &opts)
            .await
            .unwrap();

        map.update_all(&["a".to_string(), "b".to_string()], &[10, 20], &opts)
            .await
            .unwrap();
        assert_eq!(map.get(&"b".to_string(), &opts).await.unwrap(), Some(20));
        assert_eq!(
            map.update_all(&["a".to_string(), "zz".to_string()], &[7, 8], &opts)
                .await
                .unwrap_err(),
            crate::error::StoreError::KeyNotFound
        );
        assert_eq!(map.get(&"a".to_string(), &opts).await.unwrap(), Some(10));

        assert!(map.replace(&"a".to_string(), &"c".to_string(), None, &opts).await.unwrap());
        assert!(map.replace(&"b".to_string(), &"d".to_string(), Some(&5), &opts).await.unwrap());
        assert!(!map.replace(&"a".to_string(), &"e".to_string(), None, &opts).await.unwrap());
        let pairs = map.range(EnumerationOptions::default()).await.unwrap();
        assert_eq!(pairs, vec![("c".to_string(), 10), ("d".to_string(), 5)]);
    }

    #[tokio::test]
    async fn ordered_keys_enumerate_numerically() {
        let replica = LocalReplica::start_primary(ProviderConfig::default()).await.unwrap();
        let map: ReplicatedMap<i64, String> =
            ReplicatedMap::new(replica.provider, Codec::<i64>::ordered(), Codec::<String>::utf8());
        let items: Vec<(i64, String)> = [10, -3, 7, 0, -20]
            .into_iter()
            .map(|n| (n, format!("n{n}")))
            .collect();
        map.add_all(&items, &CallOptions::default()).await.unwrap();

        let keys: Vec<i64> = map
            .range(EnumerationOptions::default())
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec![-20, -3, 0, 7, 10]);
    }

    #[tokio::test]
    async fn group_changes_arrive_decoded_on_commit() {
        let map = map().await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        map.on_change(move |change| {
            sink.lock().push(change);
            Ok(())
        });

        let cancel = CancellationToken::new();
        let group = map.begin(&cancel).await.unwrap();
        let opts = CallOptions::in_group(group);
        map.add(&"a".to_string(), &1, &opts).await.unwrap();
        map.add_or_update(&"a".to_string(), &2, &opts).await.unwrap();
        assert!(seen.lock().is_empty());
        map.commit(group, &cancel).await.unwrap();

        assert_eq!(
            *seen.lock(),
            vec![
                MapChange::Added {
                    key: "a".to_string(),
                    value: 1
                },
                MapChange::Updated {
                    key: "a".to_string(),
                    old_value: Some(1),
                    new_value: 2
                },
            ]
        );
    }
}
