//! 通过完整路由驱动接口（内存存储）

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use clinic_database::{MemoryStore, PageSettings};
use clinic_web::{create_app, AppState, WebOptions};
use clinic_workflow::{ClinicWorkflow, WorkflowSettings};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

struct User {
    id: Uuid,
    nombre: &'static str,
    role: &'static str,
    sede: Option<&'static str>,
}

impl User {
    fn new(nombre: &'static str, role: &'static str, sede: Option<&'static str>) -> Self {
        Self {
            id: Uuid::new_v4(),
            nombre,
            role,
            sede,
        }
    }
}

fn app() -> Router {
    let state = AppState::new(
        Arc::new(MemoryStore::new()),
        ClinicWorkflow::new(WorkflowSettings::default()),
        PageSettings::default(),
    );
    create_app(state, &WebOptions::default())
}

async fn call(
    app: &Router,
    method: Method,
    uri: &str,
    user: Option<&User>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        builder = builder
            .header("x-user-id", user.id.to_string())
            .header("x-user-name", user.nombre)
            .header("x-user-role", user.role);
        if let Some(sede) = user.sede {
            builder = builder.header("x-user-sede", sede);
        }
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn create_patient(app: &Router, user: &User, email: &str) -> Value {
    let (status, body) = call(
        app,
        Method::POST,
        "/api/patients",
        Some(user),
        Some(json!({"nombre": "Lucía", "apellidos": "Martín Gómez", "email": email})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{}", body);
    body["data"].clone()
}

async fn create_budget(app: &Router, user: &User, patient: &Value) -> Value {
    let (status, body) = call(
        app,
        Method::POST,
        "/api/budgets",
        Some(user),
        Some(json!({
            "paciente": patient["id"],
            "items": [{"descripcion": "Empaste", "cantidad": 2, "precioUnitario": 100, "descuento": 10}],
            "descuentoGlobal": 0,
            "impuestos": 21
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{}", body);
    body["data"].clone()
}

async fn set_budget_status(app: &Router, user: &User, id: &str, body: Value) -> (StatusCode, Value) {
    call(app, Method::PUT, &format!("/api/budgets/{}/status", id), Some(user), Some(body)).await
}

#[tokio::test]
async fn test_missing_caller_headers_is_unauthorized() {
    let app = app();
    let (status, body) = call(&app, Method::GET, "/api/patients", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["success"], false);

    let (status, _) = call(&app, Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_patient_numbering_and_duplicate_email() {
    let app = app();
    let recepcion = User::new("Recepción Madrid", "receptionist", Some("madrid"));

    let patient = create_patient(&app, &recepcion, "lucia@example.com").await;
    let numero = patient["numeroHistoriaClinica"].as_str().unwrap();
    assert!(numero.starts_with("HC") && numero.len() == 8, "{}", numero);
    assert!(numero[2..].chars().all(|c| c.is_ascii_digit()));
    assert_eq!(patient["sede"], "madrid");

    let (status, body) = call(
        &app,
        Method::POST,
        "/api/patients",
        Some(&recepcion),
        Some(json!({"nombre": "Otra", "apellidos": "Persona", "email": "LUCIA@example.com"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "Ya existe un paciente con ese email");
}

#[tokio::test]
async fn test_budget_totals() {
    let app = app();
    let doctora = User::new("Dra. Ruiz", "clinical_professional", Some("madrid"));
    let patient = create_patient(&app, &doctora, "ana@example.com").await;

    let budget = create_budget(&app, &doctora, &patient).await;
    assert_eq!(budget["subtotal"].as_f64(), Some(180.0));
    assert_eq!(budget["total"].as_f64(), Some(217.8));
    assert_eq!(budget["estado"], "pendiente");
    assert!(budget["numero"].as_str().unwrap().starts_with("PRES-"));
    assert_eq!(budget["profesional"]["id"], json!(doctora.id));
}

#[tokio::test]
async fn test_professional_cannot_edit_colleagues_accepted_budget() {
    let app = app();
    let duena = User::new("Dra. Vidal", "clinical_professional", Some("madrid"));
    let colega = User::new("Dr. Sanz", "clinical_professional", Some("madrid"));
    let patient = create_patient(&app, &duena, "pablo@example.com").await;
    let budget = create_budget(&app, &duena, &patient).await;
    let id = budget["id"].as_str().unwrap();

    for estado in ["presentado", "aceptado"] {
        let (status, body) = set_budget_status(&app, &duena, id, json!({"estado": estado})).await;
        assert_eq!(status, StatusCode::OK, "{}", body);
    }

    let (status, body) = call(
        &app,
        Method::PUT,
        &format!("/api/budgets/{}", id),
        Some(&colega),
        Some(json!({"notas": "cambio"})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["message"], "Solo puedes modificar tus propios presupuestos");
}

#[tokio::test]
async fn test_communication_requires_budget_ownership() {
    let app = app();
    let duena = User::new("Dra. Vidal", "clinical_professional", Some("madrid"));
    let colega = User::new("Dr. Sanz", "clinical_professional", Some("madrid"));
    let admin = User::new("Admin Madrid", "admin_sede", Some("madrid"));
    let patient = create_patient(&app, &duena, "irene@example.com").await;
    let budget = create_budget(&app, &duena, &patient).await;
    let uri = format!("/api/budgets/{}/communication", budget["id"].as_str().unwrap());
    let nota = json!({"tipo": "telefono", "resumen": "Llamada de seguimiento"});

    let (status, body) = call(&app, Method::POST, &uri, Some(&colega), Some(nota.clone())).await;
    assert_eq!(status, StatusCode::FORBIDDEN, "{}", body);
    assert_eq!(body["message"], "Solo puedes modificar tus propios presupuestos");

    for user in [&duena, &admin] {
        let (status, body) = call(&app, Method::POST, &uri, Some(user), Some(nota.clone())).await;
        assert_eq!(status, StatusCode::CREATED, "{}", body);
    }
    let (_, current) = call(&app, Method::GET, &format!("/api/budgets/{}", budget["id"].as_str().unwrap()), Some(&duena), None).await;
    assert_eq!(current["data"]["comunicaciones"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_non_elevated_creator_is_the_professional() {
    let app = app();
    let doctora = User::new("Dra. Ruiz", "clinical_professional", Some("madrid"));
    let admin = User::new("Admin Madrid", "admin_sede", Some("madrid"));
    let patient = create_patient(&app, &doctora, "sergio@example.com").await;
    let otro = json!({"id": Uuid::new_v4(), "nombre": "Dr. Sanz"});
    let body = |profesional: &Value| {
        json!({
            "paciente": patient["id"],
            "profesional": profesional,
            "items": [{"descripcion": "Limpieza", "cantidad": 1, "precioUnitario": 60}],
        })
    };

    let (status, created) = call(&app, Method::POST, "/api/budgets", Some(&doctora), Some(body(&otro))).await;
    assert_eq!(status, StatusCode::CREATED, "{}", created);
    assert_eq!(created["data"]["profesional"]["id"], json!(doctora.id));

    let uri = format!("/api/budgets/{}", created["data"]["id"].as_str().unwrap());
    let (status, _) = call(&app, Method::PUT, &uri, Some(&doctora), Some(json!({"profesional": otro}))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, created) = call(&app, Method::POST, "/api/budgets", Some(&admin), Some(body(&otro))).await;
    assert_eq!(status, StatusCode::CREATED, "{}", created);
    assert_eq!(created["data"]["profesional"]["id"], otro["id"]);
}

#[tokio::test]
async fn test_receptionist_deletes_own_pending_budget() {
    let app = app();
    let recepcion = User::new("Recepción", "receptionist", Some("madrid"));
    let companera = User::new("Recepción Tarde", "receptionist", Some("madrid"));
    let patient = create_patient(&app, &recepcion, "nuria@example.com").await;

    let budget = create_budget(&app, &recepcion, &patient).await;
    let uri = format!("/api/budgets/{}", budget["id"].as_str().unwrap());
    let (status, body) = call(&app, Method::DELETE, &uri, Some(&companera), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN, "{}", body);
    let (status, body) = call(&app, Method::DELETE, &uri, Some(&recepcion), None).await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    let (status, _) = call(&app, Method::GET, &uri, Some(&recepcion), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let presented = create_budget(&app, &recepcion, &patient).await;
    let id = presented["id"].as_str().unwrap();
    let (status, _) = set_budget_status(&app, &recepcion, id, json!({"estado": "presentado"})).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = call(&app, Method::DELETE, &format!("/api/budgets/{}", id), Some(&recepcion), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN, "{}", body);
}

#[tokio::test]
async fn test_lost_budget_requires_reason() {
    let app = app();
    let doctora = User::new("Dra. Ruiz", "clinical_professional", Some("madrid"));
    let patient = create_patient(&app, &doctora, "marta@example.com").await;
    let budget = create_budget(&app, &doctora, &patient).await;
    let id = budget["id"].as_str().unwrap();

    set_budget_status(&app, &doctora, id, json!({"estado": "presentado"})).await;
    let (status, _) = set_budget_status(&app, &doctora, id, json!({"estado": "perdido"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, current) = call(&app, Method::GET, &format!("/api/budgets/{}", id), Some(&doctora), None).await;
    assert_eq!(current["data"]["estado"], "presentado");

    let (status, body) = set_budget_status(
        &app,
        &doctora,
        id,
        json!({"estado": "perdido", "motivoRechazo": "Precio"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["motivoRechazo"], "Precio");
    assert!(body["data"]["fechaRechazo"].is_string());

    let (status, _) = set_budget_status(&app, &doctora, id, json!({"estado": "aceptado"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_cross_sede_access_is_forbidden() {
    let app = app();
    let madrid = User::new("Dra. Ruiz", "clinical_professional", Some("madrid"));
    let barcelona = User::new("Dr. Puig", "admin_sede", Some("barcelona"));
    let owner = User::new("Dirección", "owner", None);

    let patient = create_patient(&app, &madrid, "jorge@example.com").await;
    let budget = create_budget(&app, &madrid, &patient).await;
    let uri = format!("/api/budgets/{}", budget["id"].as_str().unwrap());

    let (status, _) = call(&app, Method::GET, &uri, Some(&barcelona), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _) = call(&app, Method::GET, &uri, Some(&owner), None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = call(&app, Method::GET, "/api/budgets", Some(&barcelona), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["pagination"]["total"], 0);
    let (_, body) = call(&app, Method::GET, "/api/budgets", Some(&owner), None).await;
    assert_eq!(body["pagination"]["total"], 1);
}

#[tokio::test]
async fn test_route_permissions_follow_role_table() {
    let app = app();
    let recepcion = User::new("Recepción", "receptionist", Some("madrid"));

    let (status, body) = call(&app, Method::GET, "/api/budgets/stats", Some(&recepcion), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN, "{}", body);

    let (status, body) = call(&app, Method::GET, "/api/auth/permissions", Some(&recepcion), None).await;
    assert_eq!(status, StatusCode::OK);
    let permissions = body["data"]["permissions"].as_array().unwrap();
    assert!(permissions.contains(&json!("budgets:read")));
    assert!(!permissions.contains(&json!("reports:read")));
    let navegacion: Vec<_> = body["data"]["navegacion"]
        .as_array()
        .unwrap()
        .iter()
        .map(|n| n["key"].as_str().unwrap().to_string())
        .collect();
    assert!(!navegacion.contains(&"reports".to_string()));
}

#[tokio::test]
async fn test_payment_link_suspended_after_attempt_limit() {
    let app = app();
    let recepcion = User::new("Recepción", "receptionist", Some("madrid"));
    let patient = create_patient(&app, &recepcion, "elena@example.com").await;

    let (status, body) = call(
        &app,
        Method::POST,
        "/api/payment-links",
        Some(&recepcion),
        Some(json!({"paciente": patient["id"], "concepto": "Limpieza", "importe": 60, "limiteTentativas": 3})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{}", body);
    let token = body["data"]["token"].as_str().unwrap().to_string();
    let link_id = body["data"]["id"].as_str().unwrap().to_string();
    let attempt_uri = format!("/api/payment-links/public/{}/attempt", token);

    let (status, body) = call(&app, Method::GET, &format!("/api/payment-links/public/{}", token), None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["estado"], "activo");

    for expected in ["activo", "activo", "suspendido"] {
        let (status, body) = call(&app, Method::POST, &attempt_uri, None, Some(json!({}))).await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        assert_eq!(body["data"]["estado"], expected);
    }
    let (status, _) = call(&app, Method::POST, &attempt_uri, None, Some(json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, detail) = call(&app, Method::GET, &format!("/api/payment-links/{}", link_id), Some(&recepcion), None).await;
    assert_eq!(detail["data"]["intentos"], 3);
    assert_eq!(detail["data"]["visualizaciones"], 1);
    assert_eq!(detail["data"]["seguridad"]["bloqueado"], true);
}

#[tokio::test]
async fn test_payment_link_paid_only_by_its_creator() {
    let app = app();
    let recepcion = User::new("Recepción", "receptionist", Some("madrid"));
    let companera = User::new("Recepción Tarde", "receptionist", Some("madrid"));
    let patient = create_patient(&app, &recepcion, "olga@example.com").await;

    let (status, body) = call(
        &app,
        Method::POST,
        "/api/payment-links",
        Some(&recepcion),
        Some(json!({"paciente": patient["id"], "concepto": "Revisión", "importe": 45})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{}", body);
    let pay_uri = format!("/api/payment-links/{}/pay", body["data"]["id"].as_str().unwrap());

    let (status, body) = call(&app, Method::POST, &pay_uri, Some(&companera), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN, "{}", body);
    let (status, body) = call(&app, Method::POST, &pay_uri, Some(&recepcion), None).await;
    assert_eq!(status, StatusCode::CREATED, "{}", body);
}

#[tokio::test]
async fn test_completed_refund_updates_payment() {
    let app = app();
    let recepcion = User::new("Recepción", "receptionist", Some("madrid"));
    let admin = User::new("Admin Madrid", "admin_sede", Some("madrid"));
    let patient = create_patient(&app, &recepcion, "raul@example.com").await;

    let (status, body) = call(
        &app,
        Method::POST,
        "/api/payments",
        Some(&recepcion),
        Some(json!({
            "paciente": patient["id"],
            "concepto": "Ortodoncia",
            "importe": 100,
            "metodo": "tarjeta",
            "estado": "completado"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{}", body);
    let payment_id = body["data"]["id"].as_str().unwrap().to_string();

    let (status, body) = call(
        &app,
        Method::POST,
        "/api/refunds",
        Some(&recepcion),
        Some(json!({"pago": payment_id, "importeSolicitado": 40, "categoria": "insatisfaccion", "motivo": "Molestias"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{}", body);
    let refund_uri = format!("/api/refunds/{}/status", body["data"]["id"].as_str().unwrap());

    let (status, _) = call(&app, Method::PUT, &refund_uri, Some(&recepcion), Some(json!({"estado": "revisando"}))).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = call(&app, Method::PUT, &refund_uri, Some(&recepcion), Some(json!({"estado": "aprobada"}))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    for estado in ["aprobada", "procesando", "completada"] {
        let (status, body) = call(&app, Method::PUT, &refund_uri, Some(&admin), Some(json!({"estado": estado}))).await;
        assert_eq!(status, StatusCode::OK, "{}", body);
    }

    let (_, payment) = call(&app, Method::GET, &format!("/api/payments/{}", payment_id), Some(&admin), None).await;
    assert_eq!(payment["data"]["estado"], "parcial");
    assert_eq!(payment["data"]["importeReembolsado"].as_f64(), Some(40.0));

    let (status, body) = call(
        &app,
        Method::POST,
        "/api/refunds",
        Some(&recepcion),
        Some(json!({"pago": payment_id, "importeSolicitado": 70, "categoria": "otro", "motivo": "Exceso"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "{}", body);
}
