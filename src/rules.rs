//! Motor de reglas de elegibilidad.
//!
//! Evalúa un árbol booleano de condiciones (AND/OR/NOT/comparación) contra
//! el contexto del usuario y devuelve los programas que deben priorizarse.
//! Las asimetrías de los operadores (p. ej. `==` insensible a mayúsculas,
//! `!=` exacto) se conservan tal cual: cambiarlas alteraría qué programas
//! se priorizan para usuarios reales.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::Deserialize;
use serde_json::Value;
use tracing::{error, info};

use crate::errors::PipelineError;
use crate::models::UserContext;

/// Nodo del árbol de condiciones. Se deserializa desde JSON con la forma
/// `{"AND": [...]}`, `{"OR": [...]}`, `{"NOT": {...}}` o una comparación
/// hoja `{"field": ..., "operator": ..., "value": ...}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ConditionNode {
    And {
        #[serde(rename = "AND")]
        children: Vec<ConditionNode>,
    },
    Or {
        #[serde(rename = "OR")]
        children: Vec<ConditionNode>,
    },
    Not {
        #[serde(rename = "NOT")]
        child: Box<ConditionNode>,
    },
    Leaf {
        #[serde(default)]
        field: Option<String>,
        #[serde(default)]
        operator: Option<String>,
        #[serde(default)]
        value: Option<Value>,
    },
}

impl Default for ConditionNode {
    /// Una regla sin `conditions` equivale a una hoja vacía: se cumple siempre.
    fn default() -> Self {
        ConditionNode::Leaf {
            field: None,
            operator: None,
            value: None,
        }
    }
}

/// Evalúa recursivamente un nodo de condición contra el contexto del usuario.
/// Nunca falla: los desajustes de tipo se resuelven a `false` (cerrado),
/// salvo la hoja vacía que se resuelve a `true`.
pub fn evaluate(node: &ConditionNode, context: &UserContext) -> bool {
    match node {
        ConditionNode::And { children } => children.iter().all(|c| evaluate(c, context)),
        ConditionNode::Or { children } => children.iter().any(|c| evaluate(c, context)),
        ConditionNode::Not { child } => !evaluate(child, context),
        ConditionNode::Leaf {
            field,
            operator,
            value,
        } => evaluate_leaf(field.as_deref(), operator.as_deref(), value.as_ref(), context),
    }
}

fn evaluate_leaf(
    field: Option<&str>,
    operator: Option<&str>,
    value: Option<&Value>,
    context: &UserContext,
) -> bool {
    // Hoja sin campo o sin operador: condición vacía, se considera cumplida.
    let (Some(field), Some(operator)) = (field.filter(|f| !f.is_empty()), operator) else {
        return true;
    };

    // Una clave ausente se consulta como null: nunca iguala a un valor presente.
    let user_val = context.get(field).unwrap_or(&Value::Null);
    let rule_val = value.unwrap_or(&Value::Null);

    if matches!(operator, "<" | ">" | "<=" | ">=") {
        // Los operadores de orden sólo aplican entre numéricos.
        let (Some(a), Some(b)) = (user_val.as_f64(), rule_val.as_f64()) else {
            return false;
        };
        return match operator {
            "<" => a < b,
            ">" => a > b,
            "<=" => a <= b,
            ">=" => a >= b,
            _ => unreachable!(),
        };
    }

    match operator {
        // Igualdad insensible a mayúsculas cuando el valor del usuario es texto.
        "==" => match user_val {
            Value::String(s) => s.to_lowercase() == value_as_string(rule_val).to_lowercase(),
            _ => values_equal(user_val, rule_val),
        },
        // Desigualdad exacta, SIN plegado de mayúsculas.
        "!=" => !values_equal(user_val, rule_val),
        // Operador no reconocido con campo y operador presentes: no se cumple.
        _ => false,
    }
}

/// Igualdad nativa, con la salvedad de que dos números se comparan
/// numéricamente (30 == 30.0).
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn value_as_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Una regla de prioridad: descripción, árbol de condiciones y los
/// programas que se priorizan cuando las condiciones se cumplen.
#[derive(Debug, Clone, Deserialize)]
pub struct Rule {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub conditions: ConditionNode,
    #[serde(default)]
    pub priority_programs: Vec<String>,
}

/// Conjunto de reglas cargado una vez al arranque; de sólo lectura después.
#[derive(Debug, Clone)]
pub struct RulesEngine {
    rules: Vec<Rule>,
}

impl RulesEngine {
    /// Carga las reglas desde un fichero JSON. Una fuente ilegible o
    /// malformada degrada a un conjunto vacío en lugar de abortar el proceso.
    pub fn load(path: &Path) -> Self {
        let rules = match Self::read_rules(path) {
            Ok(rules) => rules,
            Err(err) => {
                error!(
                    "{}",
                    PipelineError::ConfigLoad {
                        path: path.display().to_string(),
                        reason: err.to_string(),
                    }
                );
                Vec::new()
            }
        };
        info!("Cargadas {} reglas de prioridad.", rules.len());
        Self { rules }
    }

    fn read_rules(path: &Path) -> Result<Vec<Rule>> {
        let data = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    pub fn from_rules(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    /// Devuelve la unión deduplicada de `priority_programs` de todas las
    /// reglas cuyas condiciones se cumplen. El orden de las reglas no
    /// afecta al resultado (la salida va ordenada alfabéticamente).
    pub fn evaluate(&self, context: &UserContext) -> Vec<String> {
        let mut programs = BTreeSet::new();
        for rule in &self.rules {
            if evaluate(&rule.conditions, context) {
                info!(
                    "Regla cumplida: '{}' -> prioriza {:?}",
                    rule.description, rule.priority_programs
                );
                programs.extend(rule.priority_programs.iter().cloned());
            }
        }
        programs.into_iter().collect()
    }
}
