//! Registry, resolver and graph validation.

use std::sync::Arc;
use wiremodel::*;

fn leaf(name: &str) -> TypeDefinition {
    ComplexTypeDefinition::new(name, vec![Field::simple("v", SimpleTypeReference::uint(8))]).into()
}

fn holder(name: &str, target: &str) -> TypeDefinition {
    ComplexTypeDefinition::new(name, vec![Field::simple("inner", TypeReference::complex(target))]).into()
}

fn switch_type(cases: Vec<Case>) -> TypeDefinition {
    ComplexTypeDefinition::new(
        "Message",
        vec![
            Field::discriminator("kind", SimpleTypeReference::uint(8)),
            Field::switch(&["kind"], cases),
        ],
    )
    .into()
}

fn resolved(definitions: Vec<TypeDefinition>) -> TypeContext {
    let mut registry = TypeRegistry::new();
    registry.declare_all(definitions);
    registry.resolve()
}

#[test]
fn declaration_order_does_not_matter() {
    let a = resolved(vec![holder("A", "C"), leaf("C"), holder("B", "A")]);
    let b = resolved(vec![leaf("C"), holder("B", "A"), holder("A", "C")]);
    let names = |ctx: &TypeContext| ctx.get_type_definitions().iter().map(|d| d.name().to_string()).collect::<Vec<_>>();
    assert_eq!(names(&a), vec!["A", "B", "C"]);
    assert_eq!(names(&a), names(&b));
    assert_eq!(a.get_type_definitions(), b.get_type_definitions());
    assert_eq!(a.id_of("C"), b.id_of("C"));
    assert!(a.validate().is_ok());
}

#[test]
fn cross_batch_references_resolve() {
    let mut registry = TypeRegistry::new();
    registry.declare_all(vec![holder("Frame", "Payload")]);
    registry.declare_all(vec![leaf("Payload")]);
    assert_eq!(registry.len(), 2);
    let ctx = registry.resolve();
    assert!(ctx.get_unresolved_type_references().is_empty());
    assert!(ctx.get_type_definition("Payload").is_some());
}

#[test]
fn unresolved_references_are_reported_not_dropped() {
    let params = ComplexTypeDefinition::new("P", Vec::new())
        .with_params(vec![Parameter::new("ctx", TypeReference::complex("Context"))]);
    let ctx = resolved(vec![holder("A", "Ghost"), holder("B", "Ghost"), params.into()]);
    let refs: Vec<(&str, &str)> = ctx
        .get_unresolved_type_references()
        .iter()
        .map(|u| (u.name.as_str(), u.referenced_from.as_str()))
        .collect();
    assert_eq!(refs, vec![("Ghost", "A.inner"), ("Ghost", "B.inner"), ("Context", "P(ctx)")]);
    assert_eq!(
        ctx.validate(),
        Err(SchemaError::UnresolvedTypeReferences(vec!["Context".into(), "Ghost".into()]))
    );
    assert!(Codec::new(Arc::new(ctx), ByteOrder::BigEndian).is_err());
}

#[test]
fn references_inside_cases_resolve() {
    let ctx = resolved(vec![
        leaf("Body"),
        switch_type(vec![Case::new(
            "WithBody",
            vec![1u64.into()],
            vec![Field::simple("body", TypeReference::complex("Body"))],
        )]),
    ]);
    let (owner, case) = ctx.find_case("WithBody").expect("case");
    assert_eq!(owner.name, "Message");
    assert!(owner.is_abstract);
    assert_eq!(case.parent.as_deref(), Some("Message"));
    match &case.fields[0] {
        Field::Simple {
            type_ref: TypeReference::Complex(c),
            ..
        } => assert_eq!(c.target, ctx.id_of("Body")),
        other => panic!("unexpected field {:?}", other),
    }
    assert!(ctx.validate().is_ok());
}

#[test]
fn case_names_share_the_type_namespace() {
    let ctx = resolved(vec![
        leaf("Body"),
        switch_type(vec![Case::new("Body", vec![1u64.into()], Vec::new())]),
    ]);
    assert_eq!(ctx.validate(), Err(SchemaError::DuplicateTypeName("Body".into())));
}

#[test]
fn duplicate_tuples_are_ambiguous() {
    let ctx = resolved(vec![switch_type(vec![
        Case::new("First", vec![1u64.into()], Vec::new()),
        Case::new("Second", vec![1u64.into()], Vec::new()),
    ])]);
    assert_eq!(
        ctx.validate(),
        Err(SchemaError::AmbiguousDiscriminator {
            owner: "Message".into(),
            first: "First".into(),
            second: "Second".into(),
            values: "0x1".into(),
        })
    );

    let two_defaults = resolved(vec![switch_type(vec![
        Case::new("A", Vec::new(), Vec::new()),
        Case::new("B", Vec::new(), Vec::new()),
    ])]);
    assert!(matches!(
        two_defaults.validate(),
        Err(SchemaError::AmbiguousDiscriminator { .. })
    ));
}

#[test]
fn tuple_arity_must_match() {
    let ctx = resolved(vec![switch_type(vec![Case::new(
        "Pair",
        vec![1u64.into(), 2u64.into()],
        Vec::new(),
    )])]);
    assert_eq!(
        ctx.validate(),
        Err(SchemaError::DiscriminatorArity {
            owner: "Message".into(),
            case: "Pair".into(),
            expected: 1,
            found: 2,
        })
    );
}

#[test]
fn discriminators_must_be_declared_before_the_switch() {
    let late = ComplexTypeDefinition::new(
        "Late",
        vec![
            Field::switch(&["kind"], vec![Case::new("Any", Vec::new(), Vec::new())]),
            Field::discriminator("kind", SimpleTypeReference::uint(8)),
        ],
    );
    assert_eq!(
        resolved(vec![late.into()]).validate(),
        Err(SchemaError::UnknownDiscriminatorField {
            owner: "Late".into(),
            name: "kind".into(),
        })
    );

    let by_param = ComplexTypeDefinition::new(
        "ByParam",
        vec![Field::switch(&["mode"], vec![Case::new("Any", Vec::new(), Vec::new())])],
    )
    .with_params(vec![Parameter::new("mode", SimpleTypeReference::uint(8))]);
    assert!(resolved(vec![by_param.into()]).validate().is_ok());
}

fn embedded_switch(embedders: Vec<TypeDefinition>) -> TypeContext {
    let inner = ComplexTypeDefinition::new(
        "Inner",
        vec![Field::switch(&["kind"], vec![Case::new("K1", vec![1u64.into()], Vec::new())])],
    );
    let mut definitions = embedders;
    definitions.push(inner.into());
    resolved(definitions)
}

#[test]
fn discriminators_may_come_from_every_embedding_structure() {
    let outer = ComplexTypeDefinition::new(
        "Outer",
        vec![
            Field::discriminator("kind", SimpleTypeReference::uint(8)),
            Field::simple("inner", TypeReference::complex("Inner")),
        ],
    );
    assert!(embedded_switch(vec![outer.clone().into()]).validate().is_ok());

    // one level further out, through the intermediate embedder
    let wrapper = ComplexTypeDefinition::new(
        "Wrapper",
        vec![
            Field::simple("kind", SimpleTypeReference::uint(8)),
            Field::simple("middle", TypeReference::complex("Middle")),
        ],
    );
    let middle = ComplexTypeDefinition::new("Middle", vec![Field::simple("inner", TypeReference::complex("Inner"))]);
    assert!(embedded_switch(vec![wrapper.into(), middle.into()]).validate().is_ok());

    let after = ComplexTypeDefinition::new(
        "After",
        vec![
            Field::simple("inner", TypeReference::complex("Inner")),
            Field::discriminator("kind", SimpleTypeReference::uint(8)),
        ],
    );
    assert_eq!(
        embedded_switch(vec![after.into()]).validate(),
        Err(SchemaError::UnknownDiscriminatorField {
            owner: "Inner".into(),
            name: "kind".into(),
        })
    );

    let without = ComplexTypeDefinition::new("Without", vec![Field::simple("inner", TypeReference::complex("Inner"))]);
    assert!(matches!(
        embedded_switch(vec![outer.into(), without.into()]).validate(),
        Err(SchemaError::UnknownDiscriminatorField { .. })
    ));
}

#[test]
fn enum_constants_must_fit_their_base() {
    let ctx = resolved(vec![EnumTypeDefinition::new(
        "Mode",
        SimpleTypeReference::uint(2),
        &[("IDLE", 0), ("RUN", 3), ("HALT", 4)],
    )
    .into()]);
    assert_eq!(
        ctx.validate(),
        Err(SchemaError::EnumValueOutOfRange {
            owner: "Mode".into(),
            constant: "HALT".into(),
            value: 4,
            bits: 2,
        })
    );
}

#[test]
fn decode_expressions_read_only_names_in_scope() {
    let early = ComplexTypeDefinition::new(
        "Early",
        vec![
            Field::array("data", SimpleTypeReference::byte(), ArrayLength::Count(Expr::var("count"))),
            Field::simple("count", SimpleTypeReference::uint(8)),
        ],
    );
    assert_eq!(
        resolved(vec![early.into()]).validate(),
        Err(SchemaError::UnknownExpressionName {
            owner: "Early".into(),
            field: "data".into(),
            name: "count".into(),
        })
    );

    let in_case = switch_type(vec![Case::new(
        "Text",
        vec![1u64.into()],
        vec![Field::simple("text", SimpleTypeReference::vstring(Expr::var("size").mul(Expr::uint(8))))],
    )]);
    assert!(matches!(
        resolved(vec![in_case]).validate(),
        Err(SchemaError::UnknownExpressionName { owner, name, .. }) if owner == "Text" && name == "size"
    ));

    // implicit values are computed from the whole record, assertions see their own field,
    // terminated arrays see the last item
    let fine = ComplexTypeDefinition::new(
        "Fine",
        vec![
            Field::implicit("size", SimpleTypeReference::uint(8), Expr::count("items")),
            Field::array("items", SimpleTypeReference::uint(8), ArrayLength::Count(Expr::var("size"))),
            Field::assert("check", SimpleTypeReference::uint(8), Expr::var("check").equals(Expr::var("size"))),
            Field::array(
                "rest",
                SimpleTypeReference::uint(8),
                ArrayLength::Terminated(Expr::var(LAST_ITEM).equals(Expr::uint(0))),
            ),
            Field::optional("extra", SimpleTypeReference::uint(8), Some(Expr::var("mode").equals(Expr::uint(1)))),
        ],
    )
    .with_params(vec![Parameter::new("mode", SimpleTypeReference::uint(8))]);
    assert!(resolved(vec![fine.into()]).validate().is_ok());
}

#[test]
fn signed_enum_bases_take_negative_constants() {
    let ok = EnumTypeDefinition::new(
        "Offset",
        SimpleTypeReference::int(4),
        &[("BACK", -8), ("NONE", 0), ("AHEAD", 7)],
    );
    assert!(resolved(vec![ok.into()]).validate().is_ok());

    let low = EnumTypeDefinition::new("Low", SimpleTypeReference::int(4), &[("FAR", -9)]);
    assert!(matches!(
        resolved(vec![low.into()]).validate(),
        Err(SchemaError::EnumValueOutOfRange { value: -9, bits: 4, .. })
    ));

    let unsigned = EnumTypeDefinition::new("Unsigned", SimpleTypeReference::uint(4), &[("NEG", -1)]);
    assert!(matches!(
        resolved(vec![unsigned.into()]).validate(),
        Err(SchemaError::EnumValueOutOfRange { value: -1, .. })
    ));

    let wide = EnumTypeDefinition::new("Wide", SimpleTypeReference::uint(64), &[("MAX", u64::MAX as i128)]);
    assert!(resolved(vec![wide.into()]).validate().is_ok());
}

#[test]
fn float_layouts_are_checked() {
    let ok = ComplexTypeDefinition::new(
        "Floats",
        vec![
            Field::simple("half", SimpleTypeReference::float(5, 10)),
            Field::simple("single", SimpleTypeReference::float32()),
            Field::simple("double", SimpleTypeReference::float64()),
            Field::simple("tiny", SimpleTypeReference::ufloat(4, 4)),
        ],
    );
    assert!(resolved(vec![ok.into()]).validate().is_ok());

    let too_wide = ComplexTypeDefinition::new("Wide", vec![Field::simple("x", SimpleTypeReference::float(12, 52))]);
    assert!(matches!(
        resolved(vec![too_wide.into()]).validate(),
        Err(SchemaError::BitWidthOutOfRange { kind: "float", bits: 65, .. })
    ));
}
