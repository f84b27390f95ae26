//! Modelos de dominio (chunks de documentos, niveles de acceso y contexto de usuario).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Nivel de visibilidad de un chunk.
///
/// `Public` es visible para cualquier usuario; `Advisor` sólo para
/// asesores autenticados.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    Public,
    Advisor,
}

/// Un trozo de texto normalizado de un documento fuente.
/// Se crea una vez durante la ingesta y no se modifica después.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub text: String,
    pub source_name: String,
    pub access_level: AccessLevel,
}

/// Atributos demográficos y contextuales del usuario, como mapa plano.
/// Una clave ausente NO es lo mismo que una clave con valor nulo o vacío.
pub type UserContext = HashMap<String, Value>;

/// Orden fijo en que los atributos presentes se incluyen en el resumen
/// demográfico que acompaña al prompt.
pub const DEMOGRAPHIC_FIELDS: &[&str] = &[
    "gender",
    "age",
    "age_group",
    "region",
    "occupation",
    "is_student",
    "parents_residence",
    "children",
];

/// Construye un resumen demográfico con los atributos no vacíos del
/// contexto, en el orden de `DEMOGRAPHIC_FIELDS`.
pub fn demographic_summary(context: &UserContext) -> String {
    let mut parts = Vec::new();
    for field in DEMOGRAPHIC_FIELDS {
        let Some(value) = context.get(*field) else {
            continue;
        };
        let rendered = match value {
            Value::Null => continue,
            Value::String(s) if s.trim().is_empty() => continue,
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        parts.push(format!("{field}: {rendered}"));
    }
    parts.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resumen_demografico_omite_ausentes_y_vacios() {
        let mut ctx = UserContext::new();
        ctx.insert("region".to_string(), json!("Huasteca"));
        ctx.insert("age".to_string(), json!(67));
        ctx.insert("occupation".to_string(), json!(""));
        ctx.insert("children".to_string(), json!(null));

        let summary = demographic_summary(&ctx);
        assert_eq!(summary, "age: 67, region: Huasteca");
    }

    #[test]
    fn resumen_demografico_vacio_para_contexto_vacio() {
        assert_eq!(demographic_summary(&UserContext::new()), "");
    }

    #[test]
    fn access_level_se_serializa_en_minusculas() {
        assert_eq!(
            serde_json::to_string(&AccessLevel::Advisor).unwrap(),
            "\"advisor\""
        );
        assert_eq!(
            serde_json::to_string(&AccessLevel::Public).unwrap(),
            "\"public\""
        );
    }
}
