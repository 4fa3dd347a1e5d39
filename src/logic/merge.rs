use log::{debug, info};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::time::Instant;

use crate::error::MergeError;
use crate::model::{
    Cardinality, ConflictType, EntityDef, LinkDef, MergeResult, MergeStatus, OntologySchema,
    PropertyDef, PropertyType, SchemaConflict, Severity,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeOptions {
    pub auto_resolve: bool,
    /// Report the outcome without producing a merged schema
    pub dry_run: bool,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            auto_resolve: true,
            dry_run: false,
        }
    }
}

/// Change applied to the target schema when a conflict is auto-resolved
#[derive(Debug, Clone, PartialEq)]
enum Resolution {
    PropertyType(PropertyType),
    Required(bool),
    Property(PropertyDef),
    Cardinality(Cardinality),
}

#[derive(Debug, Clone)]
struct Finding {
    conflict: SchemaConflict,
    resolution: Option<Resolution>,
}

/// Three-way merge of ontology schemas
pub struct MergeEngine;

impl MergeEngine {
    /// Classify every disagreement between two branch schemas
    pub fn analyze_conflicts(
        source: &Value,
        target: &Value,
        base: Option<&Value>,
    ) -> Result<Vec<SchemaConflict>, MergeError> {
        let (source, target, base) = Self::parse(source, target, base)?;
        Ok(Self::analyze_schemas(&source, &target, base.as_ref()))
    }

    pub fn analyze_schemas(
        source: &OntologySchema,
        target: &OntologySchema,
        base: Option<&OntologySchema>,
    ) -> Vec<SchemaConflict> {
        Self::analyze(source, target, base)
            .into_iter()
            .map(|finding| finding.conflict)
            .collect()
    }

    /// Merge `source` into `target`. Fails only when a payload is not a schema;
    /// data conflicts are reported through the result.
    pub fn merge_branches(
        source: &Value,
        target: &Value,
        base: Option<&Value>,
        options: MergeOptions,
    ) -> Result<MergeResult, MergeError> {
        let (source, target, base) = Self::parse(source, target, base)?;
        Ok(Self::merge_schemas(&source, &target, base.as_ref(), options))
    }

    pub fn merge_schemas(
        source: &OntologySchema,
        target: &OntologySchema,
        base: Option<&OntologySchema>,
        options: MergeOptions,
    ) -> MergeResult {
        let started = Instant::now();
        let findings = Self::analyze(source, target, base);

        // Fast path: nothing to reconcile
        if findings.is_empty() {
            let merged = Self::union(target.clone(), source, base);
            debug!("Merged schemas without conflicts ({} entities)", merged.entities.len());
            return MergeResult {
                status: MergeStatus::Success,
                conflicts: Vec::new(),
                merged_schema: (!options.dry_run).then_some(merged),
                auto_resolved: false,
                resolution_log: Vec::new(),
                duration_ms: elapsed_ms(started),
                error: None,
            };
        }

        let resolvable = options.auto_resolve
            && findings
                .iter()
                .all(|f| f.conflict.severity.is_auto_resolvable() && f.resolution.is_some());

        if !resolvable {
            let conflicts: Vec<_> = findings.into_iter().map(|f| f.conflict).collect();
            info!(
                "Merge blocked by {} conflicts ({} blocking)",
                conflicts.len(),
                conflicts.iter().filter(|c| c.is_blocking()).count()
            );
            return MergeResult {
                status: MergeStatus::Conflict,
                conflicts,
                merged_schema: None,
                auto_resolved: false,
                resolution_log: Vec::new(),
                duration_ms: elapsed_ms(started),
                error: None,
            };
        }

        let mut merged = target.clone();
        let mut resolution_log = Vec::with_capacity(findings.len());
        for finding in &findings {
            if let Some(resolution) = &finding.resolution {
                resolution_log.push(Self::apply(&mut merged, &finding.conflict, resolution));
            }
        }
        let merged = Self::union(merged, source, base);
        info!("Auto-resolved {} merge conflicts", resolution_log.len());

        MergeResult {
            status: MergeStatus::Success,
            conflicts: findings.into_iter().map(|f| f.conflict).collect(),
            merged_schema: (!options.dry_run).then_some(merged),
            auto_resolved: true,
            resolution_log,
            duration_ms: elapsed_ms(started),
            error: None,
        }
    }

    fn parse(
        source: &Value,
        target: &Value,
        base: Option<&Value>,
    ) -> Result<(OntologySchema, OntologySchema, Option<OntologySchema>), MergeError> {
        let source = OntologySchema::from_value(source, "source")?;
        let target = OntologySchema::from_value(target, "target")?;
        let base = base
            .map(|base| OntologySchema::from_value(base, "base"))
            .transpose()?;
        Ok((source, target, base))
    }

    fn analyze(
        source: &OntologySchema,
        target: &OntologySchema,
        base: Option<&OntologySchema>,
    ) -> Vec<Finding> {
        let mut findings = Vec::new();
        let names: BTreeSet<&String> = source.entities.keys().chain(target.entities.keys()).collect();

        for name in names {
            let base_entity = base.and_then(|b| b.entity(name));
            match (source.entity(name), target.entity(name)) {
                (Some(s), Some(t)) => {
                    Self::diff_entity(name, s, t, base_entity, base.is_some(), &mut findings)
                }
                (Some(present), None) | (None, Some(present)) => {
                    // Deleted on one side; only a conflict if the other side changed it
                    if let Some(original) = base_entity {
                        if original != present {
                            let source_deleted = source.entity(name).is_none();
                            findings.push(Finding {
                                conflict: SchemaConflict {
                                    entity_type: name.clone(),
                                    conflict_type: ConflictType::DeleteVsModify,
                                    field_name: None,
                                    source_value: entity_value(source.entity(name)),
                                    target_value: entity_value(target.entity(name)),
                                    base_value: Some(entity_value(Some(original))),
                                    severity: Severity::Error,
                                    resolution_hint: Some(format!(
                                        "Entity '{}' was deleted on the {} branch but modified on the other; keep or drop it explicitly",
                                        name,
                                        if source_deleted { "source" } else { "target" }
                                    )),
                                    suggested_resolution: None,
                                },
                                resolution: None,
                            });
                        }
                    }
                }
                (None, None) => {}
            }
        }

        findings
    }

    fn diff_entity(
        entity: &str,
        source: &EntityDef,
        target: &EntityDef,
        base: Option<&EntityDef>,
        has_base: bool,
        findings: &mut Vec<Finding>,
    ) {
        let properties: BTreeSet<&String> =
            source.properties.keys().chain(target.properties.keys()).collect();
        for name in properties {
            let original = base.and_then(|b| b.properties.get(name));
            match (source.properties.get(name), target.properties.get(name)) {
                (Some(s), Some(t)) if s != t => match original {
                    None if has_base => findings.push(new_property(entity, name, s, t)),
                    _ => diff_property(entity, name, s, t, original, findings),
                },
                (Some(present), None) | (None, Some(present)) => {
                    if let Some(original) = original {
                        if original != present {
                            findings.push(delete_vs_modify(
                                entity,
                                name,
                                source.properties.get(name).map(property_value),
                                target.properties.get(name).map(property_value),
                                property_value(original),
                                "property",
                            ));
                        }
                    }
                }
                _ => {}
            }
        }

        let links: BTreeSet<&String> = source.links.keys().chain(target.links.keys()).collect();
        for name in links {
            let original = base.and_then(|b| b.links.get(name));
            match (source.links.get(name), target.links.get(name)) {
                (Some(s), Some(t)) if s != t => diff_link(entity, name, s, t, original, findings),
                (Some(present), None) | (None, Some(present)) => {
                    if let Some(original) = original {
                        if original != present {
                            findings.push(delete_vs_modify(
                                entity,
                                name,
                                source.links.get(name).map(link_value),
                                target.links.get(name).map(link_value),
                                link_value(original),
                                "link",
                            ));
                        }
                    }
                }
                _ => {}
            }
        }
    }

    /// Apply one resolution to the merged schema, returning its log line
    fn apply(merged: &mut OntologySchema, conflict: &SchemaConflict, resolution: &Resolution) -> String {
        let location = conflict.location();
        let field = conflict.field_name.clone().unwrap_or_default();
        let entity = merged
            .entities
            .entry(conflict.entity_type.clone())
            .or_default();

        match resolution {
            Resolution::Property(def) => {
                entity.properties.insert(field, def.clone());
                format!(
                    "{}: combined independent additions (type={}, required={}, unique={})",
                    location,
                    def.property_type.as_str(),
                    def.required,
                    def.unique
                )
            }
            Resolution::PropertyType(widened) => {
                if let Some(def) = entity.properties.get_mut(&field) {
                    def.property_type = widened.clone();
                }
                format!("{}: widened type to {}", location, widened.as_str())
            }
            Resolution::Required(required) => {
                if let Some(def) = entity.properties.get_mut(&field) {
                    def.required = *required;
                }
                format!("{}: set required={}", location, required)
            }
            Resolution::Cardinality(cardinality) => {
                if let Some(link) = entity.links.get_mut(&field) {
                    link.cardinality = *cardinality;
                }
                format!("{}: widened cardinality to {}", location, cardinality_str(*cardinality))
            }
        }
    }

    /// Target plus everything the source added, minus what the source deleted
    /// relative to base. Existing target definitions always win.
    fn union(
        mut merged: OntologySchema,
        source: &OntologySchema,
        base: Option<&OntologySchema>,
    ) -> OntologySchema {
        // Additions from source
        for (name, source_entity) in &source.entities {
            let base_entity = base.and_then(|b| b.entity(name));
            match merged.entities.get_mut(name) {
                Some(entity) => {
                    for (prop, def) in &source_entity.properties {
                        let deleted_by_target =
                            base_entity.is_some_and(|b| b.properties.contains_key(prop));
                        if !entity.properties.contains_key(prop) && !deleted_by_target {
                            entity.properties.insert(prop.clone(), def.clone());
                        }
                    }
                    for (link, def) in &source_entity.links {
                        let deleted_by_target =
                            base_entity.is_some_and(|b| b.links.contains_key(link));
                        if !entity.links.contains_key(link) && !deleted_by_target {
                            entity.links.insert(link.clone(), def.clone());
                        }
                    }
                }
                None if base_entity.is_none() => {
                    merged.entities.insert(name.clone(), source_entity.clone());
                }
                None => {}
            }
        }

        // Deletions made on the source side
        let Some(base) = base else {
            return merged;
        };
        for (name, base_entity) in &base.entities {
            let Some(source_entity) = source.entity(name) else {
                merged.entities.remove(name);
                continue;
            };
            if let Some(entity) = merged.entities.get_mut(name) {
                for prop in base_entity.properties.keys() {
                    if !source_entity.properties.contains_key(prop) {
                        entity.properties.remove(prop);
                    }
                }
                for link in base_entity.links.keys() {
                    if !source_entity.links.contains_key(link) {
                        entity.links.remove(link);
                    }
                }
            }
        }
        merged
    }
}

fn diff_property(
    entity: &str,
    name: &str,
    source: &PropertyDef,
    target: &PropertyDef,
    base: Option<&PropertyDef>,
    findings: &mut Vec<Finding>,
) {
    let conflict = |conflict_type, source_value, target_value, base_value, severity, hint: String, suggested| {
        SchemaConflict {
            entity_type: entity.to_string(),
            conflict_type,
            field_name: Some(name.to_string()),
            source_value,
            target_value,
            base_value,
            severity,
            resolution_hint: Some(hint),
            suggested_resolution: suggested,
        }
    };

    if source.property_type != target.property_type {
        let base_value = base.map(|b| json!(b.property_type.as_str()));
        let finding = match source.property_type.widen(&target.property_type) {
            Some(widened) => Finding {
                conflict: conflict(
                    ConflictType::PropertyType,
                    json!(source.property_type.as_str()),
                    json!(target.property_type.as_str()),
                    base_value,
                    Severity::Info,
                    format!("Safe widening: use {}", widened.as_str()),
                    Some(json!(widened.as_str())),
                ),
                resolution: Some(Resolution::PropertyType(widened)),
            },
            None => Finding {
                conflict: conflict(
                    ConflictType::PropertyType,
                    json!(source.property_type.as_str()),
                    json!(target.property_type.as_str()),
                    base_value,
                    Severity::Error,
                    format!(
                        "Incompatible types {} and {}; choose one and migrate existing data",
                        source.property_type.as_str(),
                        target.property_type.as_str()
                    ),
                    None,
                ),
                resolution: None,
            },
        };
        findings.push(finding);
    }

    if source.required != target.required {
        // Without a base neither side is the original, so relaxing is the safe side
        let was_required = base.map_or(true, |b| b.required);
        let base_value = base.map(|b| json!(b.required));
        let finding = if was_required {
            Finding {
                conflict: conflict(
                    ConflictType::RequiredChange,
                    json!(source.required),
                    json!(target.required),
                    base_value,
                    Severity::Warn,
                    "Relaxing to optional is safe for existing data".to_string(),
                    Some(json!(false)),
                ),
                resolution: Some(Resolution::Required(false)),
            }
        } else {
            Finding {
                conflict: conflict(
                    ConflictType::RequiredChange,
                    json!(source.required),
                    json!(target.required),
                    base_value,
                    Severity::Error,
                    "Making the property required may invalidate existing records; backfill values first".to_string(),
                    None,
                ),
                resolution: None,
            }
        };
        findings.push(finding);
    }

    if source.unique != target.unique {
        findings.push(Finding {
            conflict: conflict(
                ConflictType::UniqueChange,
                json!(source.unique),
                json!(target.unique),
                base.map(|b| json!(b.unique)),
                Severity::Error,
                "Uniqueness changes need manual review of existing values".to_string(),
                None,
            ),
            resolution: None,
        });
    }
}

fn new_property(entity: &str, name: &str, source: &PropertyDef, target: &PropertyDef) -> Finding {
    let combined = PropertyDef {
        property_type: source.property_type.clone(),
        required: source.required && target.required,
        unique: source.unique || target.unique,
    };
    Finding {
        conflict: SchemaConflict {
            entity_type: entity.to_string(),
            conflict_type: ConflictType::NewProperty,
            field_name: Some(name.to_string()),
            source_value: property_value(source),
            target_value: property_value(target),
            base_value: None,
            severity: Severity::Warn,
            resolution_hint: Some(
                "Added on both branches with different definitions; combine them".to_string(),
            ),
            suggested_resolution: Some(property_value(&combined)),
        },
        resolution: Some(Resolution::Property(combined)),
    }
}

fn diff_link(
    entity: &str,
    name: &str,
    source: &LinkDef,
    target: &LinkDef,
    base: Option<&LinkDef>,
    findings: &mut Vec<Finding>,
) {
    if source.target != target.target {
        findings.push(Finding {
            conflict: SchemaConflict {
                entity_type: entity.to_string(),
                conflict_type: ConflictType::LinkTarget,
                field_name: Some(name.to_string()),
                source_value: json!(source.target),
                target_value: json!(target.target),
                base_value: base.map(|b| json!(b.target)),
                severity: Severity::Error,
                resolution_hint: Some("Link points at different entities; pick one".to_string()),
                suggested_resolution: None,
            },
            resolution: None,
        });
    }

    if source.cardinality != target.cardinality {
        // A link added on both sides has no starting point, so either order widens
        let from_one = base.map_or(true, |b| b.cardinality == Cardinality::OneToOne);
        let widening = from_one
            && matches!(
                (source.cardinality, target.cardinality),
                (Cardinality::OneToOne, Cardinality::OneToMany)
                    | (Cardinality::OneToMany, Cardinality::OneToOne)
            );
        let conflict = SchemaConflict {
            entity_type: entity.to_string(),
            conflict_type: ConflictType::LinkCardinality,
            field_name: Some(name.to_string()),
            source_value: json!(cardinality_str(source.cardinality)),
            target_value: json!(cardinality_str(target.cardinality)),
            base_value: base.map(|b| json!(cardinality_str(b.cardinality))),
            severity: if widening { Severity::Warn } else { Severity::Error },
            resolution_hint: Some(if widening {
                "ONE_TO_ONE widens safely to ONE_TO_MANY".to_string()
            } else {
                format!(
                    "Cardinality {} vs {} cannot be reconciled automatically",
                    cardinality_str(source.cardinality),
                    cardinality_str(target.cardinality)
                )
            }),
            suggested_resolution: widening.then(|| json!(cardinality_str(Cardinality::OneToMany))),
        };
        findings.push(Finding {
            conflict,
            resolution: widening.then_some(Resolution::Cardinality(Cardinality::OneToMany)),
        });
    }
}

fn delete_vs_modify(
    entity: &str,
    name: &str,
    source_value: Option<Value>,
    target_value: Option<Value>,
    base_value: Value,
    kind: &str,
) -> Finding {
    Finding {
        conflict: SchemaConflict {
            entity_type: entity.to_string(),
            conflict_type: ConflictType::DeleteVsModify,
            field_name: Some(name.to_string()),
            source_value: source_value.unwrap_or(Value::Null),
            target_value: target_value.unwrap_or(Value::Null),
            base_value: Some(base_value),
            severity: Severity::Error,
            resolution_hint: Some(format!(
                "The {} was deleted on one branch and modified on the other",
                kind
            )),
            suggested_resolution: None,
        },
        resolution: None,
    }
}

fn property_value(def: &PropertyDef) -> Value {
    json!({
        "type": def.property_type.as_str(),
        "required": def.required,
        "unique": def.unique,
    })
}

fn link_value(def: &LinkDef) -> Value {
    json!({
        "target": def.target,
        "cardinality": cardinality_str(def.cardinality),
    })
}

fn entity_value(entity: Option<&EntityDef>) -> Value {
    entity
        .and_then(|e| serde_json::to_value(e).ok())
        .unwrap_or(Value::Null)
}

fn cardinality_str(cardinality: Cardinality) -> &'static str {
    match cardinality {
        Cardinality::OneToOne => "ONE_TO_ONE",
        Cardinality::OneToMany => "ONE_TO_MANY",
        Cardinality::ManyToOne => "MANY_TO_ONE",
        Cardinality::ManyToMany => "MANY_TO_MANY",
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
