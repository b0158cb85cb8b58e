//! 文档存储抽象

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Datelike, Utc};
use clinic_core::utils::{format_clinical_record, format_reference};
use clinic_core::{ClinicError, GroupBucket, Result};
use uuid::Uuid;

use crate::models::{Collection, Document, StoredDocument};
use crate::queries::{FieldPath, Filter, GroupBy, Query};

/// 文档存储
///
/// 每条记录带版本号：`update` 只在存储中的版本等于 `expected_version` 时成功，
/// 否则返回 [`ClinicError::Conflict`]。
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// 初始化表结构
    async fn migrate(&self) -> Result<()>;

    async fn insert(&self, collection: Collection, doc: StoredDocument) -> Result<()>;

    async fn get(&self, collection: Collection, id: Uuid) -> Result<Option<StoredDocument>>;

    /// 写入新内容，返回新版本号
    async fn update(
        &self,
        collection: Collection,
        doc: StoredDocument,
        expected_version: i64,
    ) -> Result<i64>;

    async fn delete(&self, collection: Collection, id: Uuid) -> Result<bool>;

    async fn find(&self, collection: Collection, query: &Query) -> Result<Vec<StoredDocument>>;

    async fn count(&self, collection: Collection, filter: &Filter) -> Result<u64>;

    /// 分组计数与求和
    async fn aggregate(
        &self,
        collection: Collection,
        filter: &Filter,
        group: GroupBy,
        sum: Option<FieldPath>,
    ) -> Result<Vec<GroupBucket>>;

    /// 原子递增计数器，返回递增后的值（从 1 开始）
    async fn next_sequence(&self, key: &str) -> Result<u64>;

    /// 健康检查
    async fn ping(&self) -> Result<()>;
}

pub type SharedStore = Arc<dyn DocumentStore>;

/// 编号前缀
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sequence {
    ClinicalRecord,
    Budget,
    Payment,
    PaymentLink,
    Refund,
}

impl Sequence {
    /// 计数器键；除病历号外按年重置
    fn key(&self, year: i32) -> String {
        match self {
            Sequence::ClinicalRecord => "historia_clinica".to_string(),
            Sequence::Budget => format!("presupuesto:{}", year),
            Sequence::Payment => format!("pago:{}", year),
            Sequence::PaymentLink => format!("enlace:{}", year),
            Sequence::Refund => format!("devolucion:{}", year),
        }
    }

    fn format(&self, year: i32, seq: u64) -> String {
        match self {
            Sequence::ClinicalRecord => format_clinical_record(seq),
            Sequence::Budget => format_reference("PRES", year, seq, 5),
            Sequence::Payment => format_reference("TXN", year, seq, 6),
            Sequence::PaymentLink => format_reference("LNK", year, seq, 6),
            Sequence::Refund => format_reference("REF", year, seq, 6),
        }
    }
}

/// 分配下一个编号，编号永不复用
pub async fn next_number(store: &dyn DocumentStore, sequence: Sequence) -> Result<String> {
    let year = Utc::now().year();
    let seq = store.next_sequence(&sequence.key(year)).await?;
    Ok(sequence.format(year, seq))
}

/// 带类型的仓储
pub struct Repository<T: Document> {
    store: SharedStore,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Document> Clone for Repository<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            _marker: PhantomData,
        }
    }
}

/// 一页结果
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
}

impl<T: Document> Repository<T> {
    pub fn new(store: SharedStore) -> Self {
        Self {
            store,
            _marker: PhantomData,
        }
    }

    pub async fn insert(&self, doc: &T) -> Result<()> {
        self.store.insert(T::COLLECTION, doc.to_stored()?).await
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<T>> {
        self.store
            .get(T::COLLECTION, id)
            .await?
            .map(T::from_stored)
            .transpose()
    }

    /// 读取，不存在时返回 NotFound
    pub async fn fetch(&self, id: Uuid) -> Result<T> {
        self.get(id)
            .await?
            .ok_or_else(|| ClinicError::not_found(T::COLLECTION.not_found_message()))
    }

    /// 以乐观锁保存，成功后更新 `doc` 的版本号
    pub async fn save(&self, doc: &mut T) -> Result<()> {
        let expected = doc.version();
        doc.set_version(expected + 1);
        let stored = doc.to_stored()?;
        match self.store.update(T::COLLECTION, stored, expected).await {
            Ok(version) => {
                doc.set_version(version);
                Ok(())
            }
            Err(e) => {
                doc.set_version(expected);
                Err(e)
            }
        }
    }

    pub async fn delete(&self, id: Uuid) -> Result<bool> {
        self.store.delete(T::COLLECTION, id).await
    }

    pub async fn find(&self, query: &Query) -> Result<Vec<T>> {
        self.store
            .find(T::COLLECTION, query)
            .await?
            .into_iter()
            .map(T::from_stored)
            .collect()
    }

    /// 列表与计数使用同一条件
    pub async fn page(&self, query: &Query) -> Result<Page<T>> {
        let items = self.find(query).await?;
        let total = self.count(&query.filter).await?;
        Ok(Page { items, total })
    }

    pub async fn count(&self, filter: &Filter) -> Result<u64> {
        self.store.count(T::COLLECTION, filter).await
    }

    pub async fn exists(&self, filter: &Filter) -> Result<bool> {
        Ok(self.count(filter).await? > 0)
    }

    pub async fn aggregate(
        &self,
        filter: &Filter,
        group: GroupBy,
        sum: Option<FieldPath>,
    ) -> Result<Vec<GroupBucket>> {
        self.store.aggregate(T::COLLECTION, filter, group, sum).await
    }
}

/// 所有集合的仓储
#[derive(Clone)]
pub struct Repositories {
    pub store: SharedStore,
    pub patients: Repository<clinic_core::Patient>,
    pub budgets: Repository<clinic_core::Budget>,
    pub payments: Repository<clinic_core::Payment>,
    pub payment_links: Repository<clinic_core::PaymentLink>,
    pub refunds: Repository<clinic_core::Refund>,
}

impl Repositories {
    pub fn new(store: SharedStore) -> Self {
        Self {
            patients: Repository::new(store.clone()),
            budgets: Repository::new(store.clone()),
            payments: Repository::new(store.clone()),
            payment_links: Repository::new(store.clone()),
            refunds: Repository::new(store.clone()),
            store,
        }
    }

    pub async fn next_number(&self, sequence: Sequence) -> Result<String> {
        next_number(self.store.as_ref(), sequence).await
    }
}
