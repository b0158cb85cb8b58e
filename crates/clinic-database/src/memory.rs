//! 内存存储
//!
//! 用于测试和 `--in-memory` 启动模式，语义与 PostgreSQL 实现一致。

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use clinic_core::{ClinicError, GroupBucket, Result};
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{Collection, StoredDocument};
use crate::queries::{as_decimal, compare_documents, group_key, lookup, FieldPath, Filter, GroupBy, Query};
use crate::store::DocumentStore;

#[derive(Default)]
struct Inner {
    collections: HashMap<Collection, HashMap<Uuid, StoredDocument>>,
    counters: HashMap<String, u64>,
}

/// 内存文档存储
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn matching<'a>(
        docs: Option<&'a HashMap<Uuid, StoredDocument>>,
        filter: &'a Filter,
    ) -> impl Iterator<Item = &'a StoredDocument> + 'a {
        docs.into_iter()
            .flat_map(|docs| docs.values())
            .filter(move |doc| filter.matches(&doc.data))
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn migrate(&self) -> Result<()> {
        Ok(())
    }

    async fn insert(&self, collection: Collection, doc: StoredDocument) -> Result<()> {
        let mut inner = self.inner.write().await;
        let docs = inner.collections.entry(collection).or_default();
        if docs.values().any(|d| d.id == doc.id || d.numero == doc.numero) {
            return Err(ClinicError::Conflict(format!(
                "El registro {} ya existe",
                doc.numero
            )));
        }
        docs.insert(doc.id, doc);
        Ok(())
    }

    async fn get(&self, collection: Collection, id: Uuid) -> Result<Option<StoredDocument>> {
        let inner = self.inner.read().await;
        Ok(inner
            .collections
            .get(&collection)
            .and_then(|docs| docs.get(&id))
            .cloned())
    }

    async fn update(
        &self,
        collection: Collection,
        mut doc: StoredDocument,
        expected_version: i64,
    ) -> Result<i64> {
        let mut inner = self.inner.write().await;
        let current = inner
            .collections
            .get_mut(&collection)
            .and_then(|docs| docs.get_mut(&doc.id))
            .ok_or_else(|| ClinicError::not_found(collection.not_found_message()))?;
        if current.version != expected_version {
            return Err(ClinicError::Conflict(
                "El registro fue modificado por otro usuario; recarga e inténtalo de nuevo"
                    .to_string(),
            ));
        }
        let version = expected_version + 1;
        doc.version = version;
        if let Some(data) = doc.data.as_object_mut() {
            data.insert("version".to_string(), version.into());
        }
        *current = doc;
        Ok(version)
    }

    async fn delete(&self, collection: Collection, id: Uuid) -> Result<bool> {
        let mut inner = self.inner.write().await;
        Ok(inner
            .collections
            .get_mut(&collection)
            .and_then(|docs| docs.remove(&id))
            .is_some())
    }

    async fn find(&self, collection: Collection, query: &Query) -> Result<Vec<StoredDocument>> {
        let inner = self.inner.read().await;
        let mut docs: Vec<&StoredDocument> =
            Self::matching(inner.collections.get(&collection), &query.filter).collect();
        docs.sort_by(|a, b| {
            compare_documents(&a.data, &b.data, &query.sort).then_with(|| match query.sort.order {
                crate::queries::SortOrder::Asc => a.id.cmp(&b.id),
                crate::queries::SortOrder::Desc => b.id.cmp(&a.id),
            })
        });
        Ok(docs
            .into_iter()
            .skip(query.offset as usize)
            .take(query.limit as usize)
            .cloned()
            .collect())
    }

    async fn count(&self, collection: Collection, filter: &Filter) -> Result<u64> {
        let inner = self.inner.read().await;
        Ok(Self::matching(inner.collections.get(&collection), filter).count() as u64)
    }

    async fn aggregate(
        &self,
        collection: Collection,
        filter: &Filter,
        group: GroupBy,
        sum: Option<FieldPath>,
    ) -> Result<Vec<GroupBucket>> {
        let inner = self.inner.read().await;
        let mut buckets: BTreeMap<String, (u64, Decimal)> = BTreeMap::new();
        for doc in Self::matching(inner.collections.get(&collection), filter) {
            let entry = buckets.entry(group_key(&doc.data, group)).or_default();
            entry.0 += 1;
            if let Some(value) = sum.and_then(|field| lookup(&doc.data, field)).and_then(as_decimal) {
                entry.1 += value;
            }
        }
        Ok(buckets
            .into_iter()
            .map(|(key, (count, sum))| GroupBucket { key, count, sum })
            .collect())
    }

    async fn next_sequence(&self, key: &str) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let counter = inner.counters.entry(key.to_string()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queries::{FieldKind, Predicate, Sort, SortOrder};
    use crate::store::{next_number, Repository, Sequence, SharedStore};
    use clinic_core::{ActorRef, Patient, PatientStatus, RecordMeta};
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn stored(numero: &str, estado: &str, total: f64) -> StoredDocument {
        StoredDocument {
            id: Uuid::new_v4(),
            numero: numero.to_string(),
            sede: "madrid".to_string(),
            version: 0,
            data: json!({
                "numero": numero,
                "estado": estado,
                "total": total,
                "createdAt": "2026-02-01T10:00:00Z",
            }),
        }
    }

    fn patient(nombre: &str) -> Patient {
        Patient {
            id: Uuid::new_v4(),
            numero_historia_clinica: format!("HC{}", nombre.len()),
            nombre: nombre.to_string(),
            apellidos: "López".to_string(),
            dni: None,
            fecha_nacimiento: None,
            genero: None,
            email: None,
            telefono: None,
            direccion: None,
            alergias: vec![],
            medicamentos: vec![],
            antecedentes: None,
            notas_clinicas: None,
            sede: "madrid".to_string(),
            profesional_asignado: None,
            estado: PatientStatus::Activo,
            etiquetas: vec![],
            historial_cambios: vec![],
            meta: RecordMeta::new(ActorRef::new(Uuid::nil(), "Sistema"), chrono::Utc::now()),
        }
    }

    #[tokio::test]
    async fn test_find_sorts_pages_and_counts() {
        let store = MemoryStore::new();
        for (i, total) in [300.0, 100.0, 200.0].into_iter().enumerate() {
            store
                .insert(Collection::Budgets, stored(&format!("PRES-2026-0000{}", i), "pendiente", total))
                .await
                .unwrap();
        }
        store
            .insert(Collection::Budgets, stored("PRES-2026-00009", "aceptado", 50.0))
            .await
            .unwrap();

        let filter = Filter::new().eq("estado", "pendiente");
        let mut query = Query::new(filter.clone());
        query.sort = Sort {
            field: "total",
            kind: FieldKind::Number,
            order: SortOrder::Asc,
        };
        query.limit = 2;
        let page = store.find(Collection::Budgets, &query).await.unwrap();
        let totals: Vec<_> = page.iter().map(|d| d.data["total"].as_f64().unwrap()).collect();
        assert_eq!(totals, vec![100.0, 200.0]);
        assert_eq!(store.count(Collection::Budgets, &filter).await.unwrap(), 3);
        assert_eq!(
            store
                .count(Collection::Budgets, &Filter::new().and(Predicate::In("estado", vec![])))
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_aggregate_by_status() {
        let store = MemoryStore::new();
        store.insert(Collection::Budgets, stored("A", "pendiente", 100.0)).await.unwrap();
        store.insert(Collection::Budgets, stored("B", "pendiente", 50.5)).await.unwrap();
        store.insert(Collection::Budgets, stored("C", "aceptado", 10.0)).await.unwrap();

        let buckets = store
            .aggregate(Collection::Budgets, &Filter::new(), GroupBy::Field("estado"), Some("total"))
            .await
            .unwrap();
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].key, "aceptado");
        assert_eq!(buckets[1].count, 2);
        assert_eq!(buckets[1].sum, Decimal::new(1505, 1));
    }

    #[tokio::test]
    async fn test_stale_version_is_rejected() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let repo = Repository::<Patient>::new(store);
        let mut original = patient("Ana");
        repo.insert(&original).await.unwrap();

        let mut concurrent = repo.fetch(original.id).await.unwrap();
        concurrent.nombre = "Ana María".to_string();
        repo.save(&mut concurrent).await.unwrap();
        assert_eq!(concurrent.meta.version, 1);

        original.nombre = "Anita".to_string();
        let err = repo.save(&mut original).await.unwrap_err();
        assert!(matches!(err, ClinicError::Conflict(_)));
        assert_eq!(original.meta.version, 0);

        let reloaded = repo.fetch(original.id).await.unwrap();
        assert_eq!(reloaded.nombre, "Ana María");
        assert_eq!(reloaded.meta.version, 1);
    }

    #[tokio::test]
    async fn test_sequence_numbers_unique_under_concurrency() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..50 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                next_number(store.as_ref(), Sequence::Budget).await.unwrap()
            }));
        }
        let mut numbers = HashSet::new();
        for handle in handles {
            numbers.insert(handle.await.unwrap());
        }
        assert_eq!(numbers.len(), 50);
        assert!(numbers.iter().all(|n| n.starts_with("PRES-") && n.len() == "PRES-2026-00001".len()));
    }
}
