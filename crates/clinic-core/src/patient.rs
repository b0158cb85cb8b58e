//! 患者档案

use std::fmt;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{ClinicError, Result};
use crate::models::{ActorRef, RecordMeta};
use crate::policy::Scoped;
use crate::utils::{is_valid_dni, is_valid_email, is_valid_phone, normalize_optional, require_text};

/// 患者状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum PatientStatus {
    #[default]
    Activo,
    Inactivo,
    Pendiente,
    Fallecido,
    Suspendido,
}

impl PatientStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatientStatus::Activo => "activo",
            PatientStatus::Inactivo => "inactivo",
            PatientStatus::Pendiente => "pendiente",
            PatientStatus::Fallecido => "fallecido",
            PatientStatus::Suspendido => "suspendido",
        }
    }
}

impl fmt::Display for PatientStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 字段变更记录
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChangeLogEntry {
    pub campo: String,
    pub valor_anterior: Value,
    pub valor_nuevo: Value,
    pub fecha: DateTime<Utc>,
    pub usuario: ActorRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub motivo: Option<String>,
}

/// 患者
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Patient {
    pub id: Uuid,
    pub numero_historia_clinica: String,
    pub nombre: String,
    pub apellidos: String,
    #[serde(default)]
    pub dni: Option<String>,
    #[serde(default)]
    pub fecha_nacimiento: Option<NaiveDate>,
    #[serde(default)]
    pub genero: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub telefono: Option<String>,
    #[serde(default)]
    pub direccion: Option<String>,
    // 临床字段，读取需要 patients:clinical_history
    #[serde(default)]
    pub alergias: Vec<String>,
    #[serde(default)]
    pub medicamentos: Vec<String>,
    #[serde(default)]
    pub antecedentes: Option<String>,
    #[serde(default)]
    pub notas_clinicas: Option<String>,
    pub sede: String,
    #[serde(default)]
    pub profesional_asignado: Option<ActorRef>,
    #[serde(default)]
    pub estado: PatientStatus,
    #[serde(default)]
    pub etiquetas: Vec<String>,
    #[serde(default)]
    pub historial_cambios: Vec<ChangeLogEntry>,
    #[serde(flatten)]
    pub meta: RecordMeta,
}

/// 创建患者请求
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPatient {
    pub nombre: String,
    pub apellidos: String,
    pub dni: Option<String>,
    pub fecha_nacimiento: Option<NaiveDate>,
    pub genero: Option<String>,
    pub email: Option<String>,
    pub telefono: Option<String>,
    pub direccion: Option<String>,
    #[serde(default)]
    pub alergias: Vec<String>,
    #[serde(default)]
    pub medicamentos: Vec<String>,
    pub antecedentes: Option<String>,
    pub notas_clinicas: Option<String>,
    pub sede: Option<String>,
    pub profesional_asignado: Option<ActorRef>,
    pub estado: Option<PatientStatus>,
    #[serde(default)]
    pub etiquetas: Vec<String>,
}

/// 更新患者请求（字段缺省表示不修改）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientUpdate {
    pub nombre: Option<String>,
    pub apellidos: Option<String>,
    pub dni: Option<String>,
    pub fecha_nacimiento: Option<NaiveDate>,
    pub genero: Option<String>,
    pub email: Option<String>,
    pub telefono: Option<String>,
    pub direccion: Option<String>,
    pub alergias: Option<Vec<String>>,
    pub medicamentos: Option<Vec<String>>,
    pub antecedentes: Option<String>,
    pub notas_clinicas: Option<String>,
    pub profesional_asignado: Option<ActorRef>,
    pub etiquetas: Option<Vec<String>>,
    pub motivo: Option<String>,
    pub version: Option<i64>,
}

fn validate_identity(
    dni: Option<&str>,
    email: Option<&str>,
    telefono: Option<&str>,
    fecha_nacimiento: Option<NaiveDate>,
    today: NaiveDate,
) -> Result<()> {
    if let Some(dni) = dni {
        if !is_valid_dni(dni) {
            return Err(ClinicError::validation("El DNI no tiene un formato válido"));
        }
    }
    if let Some(email) = email {
        if !is_valid_email(email) {
            return Err(ClinicError::validation("El email no tiene un formato válido"));
        }
    }
    if let Some(telefono) = telefono {
        if !is_valid_phone(telefono) {
            return Err(ClinicError::validation("El teléfono no tiene un formato válido"));
        }
    }
    if let Some(fecha) = fecha_nacimiento {
        if fecha > today {
            return Err(ClinicError::validation(
                "La fecha de nacimiento no puede ser futura",
            ));
        }
    }
    Ok(())
}

impl NewPatient {
    /// 规范化并校验输入
    pub fn normalize(mut self, today: NaiveDate) -> Result<Self> {
        require_text("El nombre", &self.nombre, 100)?;
        require_text("Los apellidos", &self.apellidos, 150)?;
        self.nombre = self.nombre.trim().to_string();
        self.apellidos = self.apellidos.trim().to_string();
        self.dni = normalize_optional(self.dni).map(|d| d.to_uppercase());
        self.email = normalize_optional(self.email).map(|e| e.to_lowercase());
        self.telefono = normalize_optional(self.telefono);
        validate_identity(
            self.dni.as_deref(),
            self.email.as_deref(),
            self.telefono.as_deref(),
            self.fecha_nacimiento,
            today,
        )?;
        Ok(self)
    }

    pub fn into_patient(
        self,
        id: Uuid,
        numero_historia_clinica: String,
        sede: String,
        creado_por: ActorRef,
        now: DateTime<Utc>,
    ) -> Patient {
        Patient {
            id,
            numero_historia_clinica,
            nombre: self.nombre,
            apellidos: self.apellidos,
            dni: self.dni,
            fecha_nacimiento: self.fecha_nacimiento,
            genero: normalize_optional(self.genero),
            email: self.email,
            telefono: self.telefono,
            direccion: normalize_optional(self.direccion),
            alergias: self.alergias,
            medicamentos: self.medicamentos,
            antecedentes: normalize_optional(self.antecedentes),
            notas_clinicas: normalize_optional(self.notas_clinicas),
            sede,
            profesional_asignado: self.profesional_asignado,
            estado: self.estado.unwrap_or_default(),
            etiquetas: self.etiquetas,
            historial_cambios: Vec::new(),
            meta: RecordMeta::new(creado_por, now),
        }
    }
}

impl Patient {
    pub fn nombre_completo(&self) -> String {
        format!("{} {}", self.nombre, self.apellidos)
    }

    pub fn edad(&self, today: NaiveDate) -> Option<u32> {
        let nacimiento = self.fecha_nacimiento?;
        let mut years = today.year() - nacimiento.year();
        if (today.month(), today.day()) < (nacimiento.month(), nacimiento.day()) {
            years -= 1;
        }
        u32::try_from(years).ok()
    }

    fn record_change(
        &mut self,
        campo: &str,
        anterior: Value,
        nuevo: Value,
        actor: &ActorRef,
        motivo: &Option<String>,
        now: DateTime<Utc>,
    ) {
        if anterior == nuevo {
            return;
        }
        self.historial_cambios.push(ChangeLogEntry {
            campo: campo.to_string(),
            valor_anterior: anterior,
            valor_nuevo: nuevo,
            fecha: now,
            usuario: actor.clone(),
            motivo: motivo.clone(),
        });
    }

    /// 应用字段更新，每个实际变化的字段追加一条变更记录
    pub fn apply_update(
        &mut self,
        update: PatientUpdate,
        actor: &ActorRef,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let motivo = normalize_optional(update.motivo.clone());

        macro_rules! set_field {
            ($field:ident, $name:literal, $value:expr) => {
                if let Some(value) = $value {
                    let before = serde_json::to_value(&self.$field)?;
                    let after = serde_json::to_value(&value)?;
                    self.$field = value;
                    self.record_change($name, before, after, actor, &motivo, now);
                }
            };
        }

        if let Some(nombre) = &update.nombre {
            require_text("El nombre", nombre, 100)?;
        }
        if let Some(apellidos) = &update.apellidos {
            require_text("Los apellidos", apellidos, 150)?;
        }
        let dni = update.dni.map(|d| normalize_optional(Some(d)).map(|d| d.to_uppercase()));
        let email = update.email.map(|e| normalize_optional(Some(e)).map(|e| e.to_lowercase()));
        let telefono = update.telefono.map(|t| normalize_optional(Some(t)));
        validate_identity(
            dni.as_ref().and_then(|d| d.as_deref()),
            email.as_ref().and_then(|e| e.as_deref()),
            telefono.as_ref().and_then(|t| t.as_deref()),
            update.fecha_nacimiento,
            now.date_naive(),
        )?;

        set_field!(nombre, "nombre", update.nombre.map(|n| n.trim().to_string()));
        set_field!(apellidos, "apellidos", update.apellidos.map(|a| a.trim().to_string()));
        set_field!(dni, "dni", dni);
        set_field!(fecha_nacimiento, "fechaNacimiento", update.fecha_nacimiento.map(Some));
        set_field!(genero, "genero", update.genero.map(|g| normalize_optional(Some(g))));
        set_field!(email, "email", email);
        set_field!(telefono, "telefono", telefono);
        set_field!(direccion, "direccion", update.direccion.map(|d| normalize_optional(Some(d))));
        set_field!(alergias, "alergias", update.alergias);
        set_field!(medicamentos, "medicamentos", update.medicamentos);
        set_field!(antecedentes, "antecedentes", update.antecedentes.map(|a| normalize_optional(Some(a))));
        set_field!(notas_clinicas, "notasClinicas", update.notas_clinicas.map(|n| normalize_optional(Some(n))));
        set_field!(profesional_asignado, "profesionalAsignado", update.profesional_asignado.map(Some));
        set_field!(etiquetas, "etiquetas", update.etiquetas);

        self.meta.touch(actor, now);
        Ok(())
    }

    /// 患者状态可在任意值之间切换，变更写入历史
    pub fn change_status(
        &mut self,
        estado: PatientStatus,
        motivo: Option<String>,
        actor: &ActorRef,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if estado == self.estado {
            return Err(ClinicError::validation(format!(
                "El paciente ya está en estado '{}'",
                estado
            )));
        }
        if self.estado == PatientStatus::Fallecido {
            return Err(ClinicError::invalid_transition(self.estado, estado));
        }
        let motivo = normalize_optional(motivo);
        let before = Value::String(self.estado.as_str().to_string());
        let after = Value::String(estado.as_str().to_string());
        self.estado = estado;
        self.record_change("estado", before, after, actor, &motivo, now);
        self.meta.touch(actor, now);
        Ok(())
    }

    pub fn summary(&self) -> PatientSummary {
        PatientSummary {
            id: self.id,
            numero_historia_clinica: self.numero_historia_clinica.clone(),
            nombre_completo: self.nombre_completo(),
            dni: self.dni.clone(),
            email: self.email.clone(),
            telefono: self.telefono.clone(),
            sede: self.sede.clone(),
            estado: self.estado,
            profesional_asignado: self.profesional_asignado.clone(),
        }
    }

    /// 详情视图；无病历权限时隐藏临床字段
    pub fn view(&self, include_clinical: bool, today: NaiveDate) -> PatientView {
        let mut patient = self.clone();
        if !include_clinical {
            patient.alergias.clear();
            patient.medicamentos.clear();
            patient.antecedentes = None;
            patient.notas_clinicas = None;
        }
        PatientView {
            edad: self.edad(today),
            nombre_completo: self.nombre_completo(),
            patient,
        }
    }

    pub fn clinical_history(&self) -> ClinicalHistory {
        ClinicalHistory {
            paciente: self.id,
            numero_historia_clinica: self.numero_historia_clinica.clone(),
            alergias: self.alergias.clone(),
            medicamentos: self.medicamentos.clone(),
            antecedentes: self.antecedentes.clone(),
            notas_clinicas: self.notas_clinicas.clone(),
        }
    }
}

impl Scoped for Patient {
    const LABEL: &'static str = "el paciente";
    const OWN_RECORDS_MESSAGE: &'static str = "Solo puedes modificar tus propios pacientes";

    fn sede(&self) -> &str {
        &self.sede
    }

    fn is_owned_by(&self, user_id: Uuid) -> bool {
        self.meta.creado_por.id == user_id
            || self
                .profesional_asignado
                .as_ref()
                .is_some_and(|p| p.id == user_id)
    }

    fn terminal_state(&self) -> Option<String> {
        (self.estado == PatientStatus::Fallecido).then(|| self.estado.to_string())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientSummary {
    pub id: Uuid,
    pub numero_historia_clinica: String,
    pub nombre_completo: String,
    pub dni: Option<String>,
    pub email: Option<String>,
    pub telefono: Option<String>,
    pub sede: String,
    pub estado: PatientStatus,
    pub profesional_asignado: Option<ActorRef>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientView {
    #[serde(flatten)]
    pub patient: Patient,
    pub edad: Option<u32>,
    pub nombre_completo: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClinicalHistory {
    pub paciente: Uuid,
    pub numero_historia_clinica: String,
    pub alergias: Vec<String>,
    pub medicamentos: Vec<String>,
    pub antecedentes: Option<String>,
    pub notas_clinicas: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn actor() -> ActorRef {
        ActorRef::new(Uuid::new_v4(), "Recepción")
    }

    fn patient() -> Patient {
        let now = Utc::now();
        NewPatient {
            nombre: " Ana ".into(),
            apellidos: "García López".into(),
            email: Some("Ana@Example.com".into()),
            alergias: vec!["penicilina".into()],
            ..Default::default()
        }
        .normalize(now.date_naive())
        .unwrap()
        .into_patient(Uuid::new_v4(), "HC000001".into(), "madrid".into(), actor(), now)
    }

    #[test]
    fn test_normalize_trims_and_lowercases() {
        let p = patient();
        assert_eq!(p.nombre, "Ana");
        assert_eq!(p.email.as_deref(), Some("ana@example.com"));
        assert_eq!(p.estado, PatientStatus::Activo);
    }

    #[test]
    fn test_invalid_email_rejected() {
        let result = NewPatient {
            nombre: "Ana".into(),
            apellidos: "García".into(),
            email: Some("no-es-email".into()),
            ..Default::default()
        }
        .normalize(Utc::now().date_naive());
        assert!(matches!(result, Err(ClinicError::Validation(_))));
    }

    #[test]
    fn test_update_appends_change_log_only_for_changed_fields() {
        let mut p = patient();
        let update = PatientUpdate {
            nombre: Some("Ana".into()),
            telefono: Some("600123123".into()),
            motivo: Some("actualización de contacto".into()),
            ..Default::default()
        };
        p.apply_update(update, &actor(), Utc::now()).unwrap();
        assert_eq!(p.historial_cambios.len(), 1);
        assert_eq!(p.historial_cambios[0].campo, "telefono");
        assert_eq!(p.historial_cambios[0].valor_anterior, Value::Null);
    }

    #[test]
    fn test_status_change_is_logged() {
        let mut p = patient();
        p.change_status(PatientStatus::Inactivo, Some("baja voluntaria".into()), &actor(), Utc::now())
            .unwrap();
        assert_eq!(p.estado, PatientStatus::Inactivo);
        let entry = p.historial_cambios.last().unwrap();
        assert_eq!(entry.campo, "estado");
        assert_eq!(entry.valor_nuevo, Value::String("inactivo".into()));

        assert!(p
            .change_status(PatientStatus::Inactivo, None, &actor(), Utc::now())
            .is_err());
    }

    #[test]
    fn test_view_hides_clinical_fields_without_permission() {
        let p = patient();
        let today = Utc::now().date_naive();
        assert!(p.view(false, today).patient.alergias.is_empty());
        assert_eq!(p.view(true, today).patient.alergias, vec!["penicilina".to_string()]);
    }

    #[test]
    fn test_age_computation() {
        let mut p = patient();
        p.fecha_nacimiento = NaiveDate::from_ymd_opt(1990, 6, 15);
        let today = NaiveDate::from_ymd_opt(2026, 6, 14).unwrap();
        assert_eq!(p.edad(today), Some(35));
        let today = NaiveDate::from_ymd_opt(2026, 6, 15).unwrap();
        assert_eq!(p.edad(today), Some(36));
    }
}
