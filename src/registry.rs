//! Type registry and resolver.
//!
//! Declarations are collected in any order (one batch per schema file, forward references
//! allowed). [`TypeRegistry::resolve`] sorts them into an arena by name, patches every
//! complex type reference with its [`TypeId`] and records what it could not resolve.
//! The resulting [`TypeContext`] is immutable; [`TypeContext::validate`] checks the graph
//! invariants a codec relies on.

use crate::codec::LAST_ITEM;
use crate::dispatch::same_tuple;
use crate::error::SchemaError;
use crate::expr::Expr;
use crate::model::{
    ArrayLength, Case, ComplexTypeDefinition, Field, SimpleKind, TypeDefinition, TypeId, TypeReference,
};
use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, warn};

#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    declarations: Vec<TypeDefinition>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare(&mut self, definition: impl Into<TypeDefinition>) -> &mut Self {
        self.declarations.push(definition.into());
        self
    }

    pub fn declare_all(&mut self, definitions: impl IntoIterator<Item = TypeDefinition>) -> &mut Self {
        self.declarations.extend(definitions);
        self
    }

    pub fn len(&self) -> usize {
        self.declarations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.declarations.is_empty()
    }

    pub fn resolve(self) -> TypeContext {
        let mut types = self.declarations;
        types.sort_by(|a, b| a.name().cmp(b.name()));

        let mut by_name = HashMap::new();
        let mut duplicates = Vec::new();
        for (index, def) in types.iter().enumerate() {
            match by_name.entry(def.name().to_string()) {
                Entry::Occupied(_) => duplicates.push(def.name().to_string()),
                Entry::Vacant(slot) => {
                    slot.insert(TypeId(index));
                }
            }
        }

        let mut cases = HashMap::new();
        for (index, def) in types.iter().enumerate() {
            if let TypeDefinition::Complex(c) = def {
                collect_case_names(&c.fields, TypeId(index), &by_name, &mut cases, &mut duplicates);
            }
        }

        let mut unresolved = Vec::new();
        for def in types.iter_mut() {
            if let TypeDefinition::Complex(c) = def {
                resolve_complex(c, &by_name, &mut unresolved);
            }
        }
        unresolved.sort_by(|a: &UnresolvedReference, b| {
            (&a.referenced_from, &a.name).cmp(&(&b.referenced_from, &b.name))
        });
        duplicates.sort();
        duplicates.dedup();

        debug!(
            types = types.len(),
            cases = cases.len(),
            unresolved = unresolved.len(),
            duplicates = duplicates.len(),
            "resolved type graph"
        );
        for u in &unresolved {
            warn!(name = %u.name, from = %u.referenced_from, "unresolved type reference");
        }

        TypeContext {
            types,
            by_name,
            cases,
            duplicates,
            unresolved,
        }
    }
}

fn collect_case_names(
    fields: &[Field],
    owner: TypeId,
    types: &HashMap<String, TypeId>,
    cases: &mut HashMap<String, TypeId>,
    duplicates: &mut Vec<String>,
) {
    for field in fields {
        if let Field::Switch(s) = field {
            for case in &s.cases {
                if types.contains_key(&case.name) || cases.insert(case.name.clone(), owner).is_some() {
                    duplicates.push(case.name.clone());
                }
                collect_case_names(&case.fields, owner, types, cases, duplicates);
            }
        }
    }
}

fn resolve_complex(def: &mut ComplexTypeDefinition, by_name: &HashMap<String, TypeId>, unresolved: &mut Vec<UnresolvedReference>) {
    let owner = def.name.clone();
    for param in def.params.iter_mut() {
        let from = format!("{}({})", owner, param.name);
        resolve_reference(&mut param.type_ref, &from, by_name, unresolved);
    }
    resolve_fields(&owner, &mut def.fields, by_name, unresolved);
}

fn resolve_fields(
    owner: &str,
    fields: &mut [Field],
    by_name: &HashMap<String, TypeId>,
    unresolved: &mut Vec<UnresolvedReference>,
) {
    for field in fields.iter_mut() {
        if let Field::Switch(s) = field {
            for case in s.cases.iter_mut() {
                case.parent = Some(owner.to_string());
                let case_name = case.name.clone();
                resolve_fields(&case_name, &mut case.fields, by_name, unresolved);
            }
            continue;
        }
        let from = format!("{}.{}", owner, field.name().unwrap_or("_"));
        if let Some(type_ref) = field.type_ref_mut() {
            resolve_reference(type_ref, &from, by_name, unresolved);
        }
    }
}

fn resolve_reference(
    type_ref: &mut TypeReference,
    from: &str,
    by_name: &HashMap<String, TypeId>,
    unresolved: &mut Vec<UnresolvedReference>,
) {
    if let TypeReference::Complex(c) = type_ref {
        c.target = by_name.get(&c.name).copied();
        if c.target.is_none() {
            unresolved.push(UnresolvedReference {
                name: c.name.clone(),
                referenced_from: from.to_string(),
            });
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedReference {
    pub name: String,
    /// `Type.field` (or `Type(param)`) holding the reference.
    pub referenced_from: String,
}

/// Resolved, read-only type graph shared by codecs.
#[derive(Debug, Clone)]
pub struct TypeContext {
    types: Vec<TypeDefinition>,
    by_name: HashMap<String, TypeId>,
    cases: HashMap<String, TypeId>,
    duplicates: Vec<String>,
    unresolved: Vec<UnresolvedReference>,
}

impl TypeContext {
    /// All definitions, sorted by name.
    pub fn get_type_definitions(&self) -> &[TypeDefinition] {
        &self.types
    }

    pub fn get_type_definition(&self, name: &str) -> Option<&TypeDefinition> {
        self.id_of(name).and_then(|id| self.get(id))
    }

    pub fn get(&self, id: TypeId) -> Option<&TypeDefinition> {
        self.types.get(id.0)
    }

    pub fn id_of(&self, name: &str) -> Option<TypeId> {
        self.by_name.get(name).copied()
    }

    pub fn complex(&self, name: &str) -> Option<&ComplexTypeDefinition> {
        self.get_type_definition(name).and_then(TypeDefinition::as_complex)
    }

    pub fn get_unresolved_type_references(&self) -> &[UnresolvedReference] {
        &self.unresolved
    }

    pub fn duplicate_names(&self) -> &[String] {
        &self.duplicates
    }

    /// A switch case by name, with the type that declares it.
    pub fn find_case(&self, name: &str) -> Option<(&ComplexTypeDefinition, &Case)> {
        let owner = self.get(*self.cases.get(name)?)?.as_complex()?;
        find_case_in(&owner.fields, name).map(|case| (owner, case))
    }

    pub fn validate(&self) -> Result<(), SchemaError> {
        if let Some(name) = self.duplicates.first() {
            return Err(SchemaError::DuplicateTypeName(name.clone()));
        }
        if !self.unresolved.is_empty() {
            let mut names: Vec<String> = self.unresolved.iter().map(|u| u.name.clone()).collect();
            names.sort();
            names.dedup();
            return Err(SchemaError::UnresolvedTypeReferences(names));
        }
        let inherited = self.inherited_names();
        for (def, outer) in self.types.iter().zip(&inherited) {
            match def {
                TypeDefinition::Enum(e) => {
                    if !e.base.has_valid_width() || e.base.bit_length > 64 {
                        return Err(SchemaError::BitWidthOutOfRange {
                            owner: e.name.clone(),
                            field: "<base>".to_string(),
                            kind: e.base.kind_name(),
                            bits: e.base.bit_length,
                        });
                    }
                    let bits = e.base.bit_length;
                    let (min, max) = match e.base.kind {
                        SimpleKind::Int => (-(1i128 << (bits - 1)), (1i128 << (bits - 1)) - 1),
                        _ => (0, (1i128 << bits) - 1),
                    };
                    for (constant, value) in &e.constants {
                        if !(min..=max).contains(value) {
                            return Err(SchemaError::EnumValueOutOfRange {
                                owner: e.name.clone(),
                                constant: constant.clone(),
                                value: *value,
                                bits,
                            });
                        }
                    }
                }
                TypeDefinition::Complex(c) => {
                    let mut declared: Vec<&str> = c.params.iter().map(|p| p.name.as_str()).collect();
                    declared.extend(outer.iter().map(String::as_str));
                    validate_fields(&c.name, &c.fields, &mut declared)?;
                }
            }
        }
        Ok(())
    }

    /// Names a type can see in the structures that embed it, indexed like the arena.
    ///
    /// A site contributes what is declared before the embedding field plus what the
    /// embedder itself inherits. The result is the intersection over all sites; a type
    /// nobody embeds inherits nothing.
    fn inherited_names(&self) -> Vec<BTreeSet<String>> {
        let mut sites: Vec<Vec<(usize, BTreeSet<String>)>> = vec![Vec::new(); self.types.len()];
        for (index, def) in self.types.iter().enumerate() {
            if let TypeDefinition::Complex(c) = def {
                let mut declared: Vec<&str> = c.params.iter().map(|p| p.name.as_str()).collect();
                collect_sites(index, &c.fields, &mut declared, &mut sites);
            }
        }

        // `None` is not yet constrained; sets only shrink, so this settles.
        let mut inherited: Vec<Option<BTreeSet<String>>> = sites
            .iter()
            .map(|s| if s.is_empty() { Some(BTreeSet::new()) } else { None })
            .collect();
        loop {
            let mut changed = false;
            for (target, embedded_at) in sites.iter().enumerate() {
                if embedded_at.is_empty() {
                    continue;
                }
                let mut visible: Option<BTreeSet<String>> = None;
                for (embedder, before) in embedded_at {
                    let Some(outer) = &inherited[*embedder] else {
                        continue;
                    };
                    let here: BTreeSet<String> = before.union(outer).cloned().collect();
                    visible = Some(match visible {
                        Some(acc) => acc.intersection(&here).cloned().collect(),
                        None => here,
                    });
                }
                if visible.is_some() && visible != inherited[target] {
                    inherited[target] = visible;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        inherited.into_iter().map(Option::unwrap_or_default).collect()
    }
}

/// Expressions evaluated while decoding `field` may only read names already in scope.
/// Implicit fields are computed on encode from the whole record and are not checked.
fn check_expressions(owner: &str, field: &Field, declared: &[&str]) -> Result<(), SchemaError> {
    const NOTHING: &[&str] = &[];
    const TERMINATOR: &[&str] = &[LAST_ITEM];
    let own: Vec<&str> = field.name().into_iter().collect();
    let mut reads: Vec<(&Expr, &[&str])> = Vec::new();
    match field {
        Field::Array { length, .. } => match length {
            ArrayLength::Count(e) | ArrayLength::LengthInBytes(e) => reads.push((e, NOTHING)),
            ArrayLength::Terminated(e) => reads.push((e, TERMINATOR)),
            ArrayLength::UntilEnd => {}
        },
        Field::Optional { condition: Some(e), .. }
        | Field::Virtual { expr: e, .. }
        | Field::Peek { offset: Some(e), .. }
        | Field::Padding { count: e, .. } => reads.push((e, NOTHING)),
        Field::Assert { condition, .. } => reads.push((condition, own.as_slice())),
        _ => {}
    }
    if !matches!(field, Field::Implicit { .. }) {
        for simple in field.simple_types() {
            if let SimpleKind::VString(length) = &simple.kind {
                reads.push((length.as_ref(), NOTHING));
            }
        }
    }
    if let Some(TypeReference::Complex(c)) = field.type_ref() {
        reads.extend(c.args.iter().map(|a| (a, NOTHING)));
    }
    for (expr, also) in reads {
        if let Some(name) = expr.variables().into_iter().find(|v| !declared.contains(v) && !also.contains(v)) {
            return Err(SchemaError::UnknownExpressionName {
                owner: owner.to_string(),
                field: field.name().unwrap_or("_").to_string(),
                name: name.to_string(),
            });
        }
    }
    Ok(())
}

fn collect_sites<'f>(
    embedder: usize,
    fields: &'f [Field],
    declared: &mut Vec<&'f str>,
    sites: &mut [Vec<(usize, BTreeSet<String>)>],
) {
    for field in fields {
        if let Field::Switch(s) = field {
            for case in &s.cases {
                let mut case_scope = declared.clone();
                collect_sites(embedder, &case.fields, &mut case_scope, sites);
            }
        }
        if let Some(TypeReference::Complex(c)) = field.type_ref() {
            if let Some(slot) = c.target.and_then(|t| sites.get_mut(t.0)) {
                slot.push((embedder, declared.iter().map(|n| n.to_string()).collect()));
            }
        }
        if let Some(name) = field.name() {
            declared.push(name);
        }
    }
}

fn find_case_in<'f>(fields: &'f [Field], name: &str) -> Option<&'f Case> {
    fields.iter().find_map(|f| match f {
        Field::Switch(s) => s
            .cases
            .iter()
            .find(|c| c.name == name)
            .or_else(|| s.cases.iter().find_map(|c| find_case_in(&c.fields, name))),
        _ => None,
    })
}

fn validate_fields<'f>(owner: &str, fields: &'f [Field], declared: &mut Vec<&'f str>) -> Result<(), SchemaError> {
    for field in fields {
        for simple in field.simple_types() {
            if !simple.has_valid_width() {
                return Err(SchemaError::BitWidthOutOfRange {
                    owner: owner.to_string(),
                    field: field.name().unwrap_or("_").to_string(),
                    kind: simple.kind_name(),
                    bits: simple.bit_length,
                });
            }
        }
        check_expressions(owner, field, declared)?;
        if let Field::Switch(s) = field {
            for name in &s.discriminators {
                let root = name.split('.').next().unwrap_or(name);
                if !declared.contains(&root) {
                    return Err(SchemaError::UnknownDiscriminatorField {
                        owner: owner.to_string(),
                        name: name.clone(),
                    });
                }
            }
            for (i, case) in s.cases.iter().enumerate() {
                if !case.is_default() && case.discriminator_values.len() != s.discriminators.len() {
                    return Err(SchemaError::DiscriminatorArity {
                        owner: owner.to_string(),
                        case: case.name.clone(),
                        expected: s.discriminators.len(),
                        found: case.discriminator_values.len(),
                    });
                }
                if let Some(earlier) = s.cases[..i]
                    .iter()
                    .find(|e| same_tuple(&e.discriminator_values, &case.discriminator_values))
                {
                    let values: Vec<String> = case.discriminator_values.iter().map(|v| v.to_string()).collect();
                    return Err(SchemaError::AmbiguousDiscriminator {
                        owner: owner.to_string(),
                        first: earlier.name.clone(),
                        second: case.name.clone(),
                        values: values.join(", "),
                    });
                }
                let mut case_scope = declared.clone();
                validate_fields(&case.name, &case.fields, &mut case_scope)?;
            }
        }
        if let Some(name) = field.name() {
            declared.push(name);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SimpleTypeReference;

    fn leaf(name: &str) -> TypeDefinition {
        ComplexTypeDefinition::new(name, vec![Field::simple("v", SimpleTypeReference::uint(8))]).into()
    }

    fn holder(name: &str, target: &str) -> TypeDefinition {
        ComplexTypeDefinition::new(name, vec![Field::simple("inner", TypeReference::complex(target))]).into()
    }

    #[test]
    fn forward_references_resolve() {
        let mut reg = TypeRegistry::new();
        reg.declare(holder("A", "B")).declare(leaf("B"));
        let ctx = reg.resolve();
        assert!(ctx.get_unresolved_type_references().is_empty());
        assert_eq!(ctx.get_type_definitions().len(), 2);
        let a = ctx.complex("A").unwrap();
        match &a.fields[0] {
            Field::Simple {
                type_ref: TypeReference::Complex(c),
                ..
            } => assert_eq!(c.target, ctx.id_of("B")),
            other => panic!("unexpected field {:?}", other),
        }
        assert!(ctx.validate().is_ok());
    }

    #[test]
    fn unresolved_names_are_recorded() {
        let mut reg = TypeRegistry::new();
        reg.declare(holder("A", "Missing"));
        let ctx = reg.resolve();
        assert_eq!(
            ctx.get_unresolved_type_references(),
            &[UnresolvedReference {
                name: "Missing".to_string(),
                referenced_from: "A.inner".to_string()
            }]
        );
        assert_eq!(
            ctx.validate(),
            Err(SchemaError::UnresolvedTypeReferences(vec!["Missing".to_string()]))
        );
    }

    #[test]
    fn duplicate_names_fail_validation() {
        let mut reg = TypeRegistry::new();
        reg.declare(leaf("A")).declare(leaf("A"));
        let ctx = reg.resolve();
        assert_eq!(ctx.duplicate_names(), &["A".to_string()]);
        assert_eq!(ctx.validate(), Err(SchemaError::DuplicateTypeName("A".to_string())));
    }

    #[test]
    fn width_checks() {
        let mut reg = TypeRegistry::new();
        reg.declare(ComplexTypeDefinition::new(
            "Wide",
            vec![Field::simple("x", SimpleTypeReference::uint(65))],
        ));
        assert!(matches!(
            reg.resolve().validate(),
            Err(SchemaError::BitWidthOutOfRange { bits: 65, .. })
        ));

        let mut reg = TypeRegistry::new();
        let mut bad_float = SimpleTypeReference::float(5, 10);
        bad_float.bit_length = 15;
        reg.declare(ComplexTypeDefinition::new("F", vec![Field::simple("x", bad_float)]));
        assert!(reg.resolve().validate().is_err());
    }
}
