//! 数据库模型

use chrono::{DateTime, Utc};
use clinic_core::{Budget, ClinicError, Patient, Payment, PaymentLink, Refund, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

/// 文档集合（每个集合对应一张表）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Patients,
    Budgets,
    Payments,
    PaymentLinks,
    Refunds,
}

impl Collection {
    pub const ALL: [Collection; 5] = [
        Collection::Patients,
        Collection::Budgets,
        Collection::Payments,
        Collection::PaymentLinks,
        Collection::Refunds,
    ];

    pub fn table(&self) -> &'static str {
        match self {
            Collection::Patients => "patients",
            Collection::Budgets => "budgets",
            Collection::Payments => "payments",
            Collection::PaymentLinks => "payment_links",
            Collection::Refunds => "refunds",
        }
    }

    /// 找不到记录时的提示
    pub fn not_found_message(&self) -> &'static str {
        match self {
            Collection::Patients => "Paciente no encontrado",
            Collection::Budgets => "Presupuesto no encontrado",
            Collection::Payments => "Pago no encontrado",
            Collection::PaymentLinks => "Enlace de pago no encontrado",
            Collection::Refunds => "Devolución no encontrada",
        }
    }
}

/// 存储层看到的文档：索引列加完整 JSON
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub id: Uuid,
    pub numero: String,
    pub sede: String,
    pub version: i64,
    pub data: Value,
}

/// 数据库文档表
#[derive(Debug, FromRow)]
pub struct DbDocument {
    pub id: Uuid,
    pub numero: String,
    pub sede: String,
    pub version: i64,
    pub data: sqlx::types::Json<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<DbDocument> for StoredDocument {
    fn from(row: DbDocument) -> Self {
        StoredDocument {
            id: row.id,
            numero: row.numero,
            sede: row.sede,
            version: row.version,
            data: row.data.0,
        }
    }
}

/// 可持久化的实体
pub trait Document: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const COLLECTION: Collection;

    fn id(&self) -> Uuid;
    fn numero(&self) -> &str;
    fn sede(&self) -> &str;
    fn version(&self) -> i64;
    fn set_version(&mut self, version: i64);

    fn to_stored(&self) -> Result<StoredDocument> {
        Ok(StoredDocument {
            id: self.id(),
            numero: self.numero().to_string(),
            sede: self.sede().to_string(),
            version: self.version(),
            data: serde_json::to_value(self)?,
        })
    }

    fn from_stored(stored: StoredDocument) -> Result<Self> {
        let mut doc: Self = serde_json::from_value(stored.data).map_err(|e| {
            ClinicError::Database(format!(
                "Documento {} corrupto en {}: {}",
                stored.id,
                Self::COLLECTION.table(),
                e
            ))
        })?;
        doc.set_version(stored.version);
        Ok(doc)
    }
}

macro_rules! impl_document {
    ($ty:ty, $collection:expr, $numero:ident) => {
        impl Document for $ty {
            const COLLECTION: Collection = $collection;

            fn id(&self) -> Uuid {
                self.id
            }

            fn numero(&self) -> &str {
                &self.$numero
            }

            fn sede(&self) -> &str {
                &self.sede
            }

            fn version(&self) -> i64 {
                self.meta.version
            }

            fn set_version(&mut self, version: i64) {
                self.meta.version = version;
            }
        }
    };
}

impl_document!(Patient, Collection::Patients, numero_historia_clinica);
impl_document!(Budget, Collection::Budgets, numero);
impl_document!(Payment, Collection::Payments, numero);
impl_document!(PaymentLink, Collection::PaymentLinks, numero);
impl_document!(Refund, Collection::Refunds, numero);
