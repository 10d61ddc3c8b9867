use lifecycle_core::{Child, Parent, ParentRef};

#[test]
fn builders_leave_identity_unset_by_default() {
    let parent = Parent::builder().name("parent").build();
    let child = Child::builder().name("child").build();

    assert!(parent.is_new());
    assert!(parent.children.is_empty());
    assert!(child.is_new());
    assert!(child.parent.is_none());
}

#[test]
fn builder_honours_preset_id() {
    let parent = Parent::builder().id(42).name("preset").build();
    let child = Child::builder().id(7).name("preset child").parent(&parent).build();

    assert_eq!(parent.id, Some(42));
    assert_eq!(child.id, Some(7));
    assert_eq!(child.parent_id(), Some(42));
}

#[test]
fn add_child_points_back_reference_at_parent() {
    let mut parent = Parent::builder().id(3).name("owner").build();
    parent.add_child(Child::new("first"));
    parent.add_child(Child::new("second"));

    assert_eq!(parent.children.len(), 2);
    for child in &parent.children {
        assert_eq!(
            child.parent,
            Some(ParentRef::to_id(3, "owner")),
            "child {} has wrong back reference",
            child.name
        );
    }
}

#[test]
fn back_reference_to_transient_parent_is_transient() {
    let mut parent = Parent::new("unsaved");
    parent.add_child(Child::new("child"));

    let back_ref = parent.children[0].parent.as_ref().unwrap();
    assert!(back_ref.is_transient());
    assert_eq!(parent.children[0].parent_id(), None);
}

#[test]
fn remove_child_clears_back_reference() {
    let mut parent = Parent::builder().id(1).name("owner").build();
    parent.add_child(Child::new("leaving"));

    let removed = parent.remove_child(0).unwrap();
    assert!(removed.parent.is_none());
    assert!(parent.children.is_empty());
    assert!(parent.remove_child(0).is_none());
}

#[test]
fn set_parent_re_associates_child() {
    let first = Parent::builder().id(1).name("first").build();
    let second = Parent::builder().id(2).name("second").build();
    let mut child = Child::builder().name("moving").parent(&first).build();

    child.set_parent(&second);

    assert_eq!(child.parent_id(), Some(2));
}

#[test]
fn entities_compare_by_value() {
    let left = Child::builder().id(1).name("same").build();
    let right = Child::builder().id(1).name("same").build();
    let other = Child::builder().id(1).name("different").build();

    assert_eq!(left, right);
    assert_ne!(left, other);
}

#[test]
fn parent_serializes_with_nested_children() {
    let mut parent = Parent::builder().id(5).name("json").build();
    parent.add_child(Child::builder().id(9).name("nested").build());

    let value = serde_json::to_value(&parent).unwrap();
    assert_eq!(value["id"], 5);
    assert_eq!(value["name"], "json");
    assert_eq!(value["children"][0]["id"], 9);
    assert_eq!(value["children"][0]["parent"]["id"], 5);

    let decoded: Parent = serde_json::from_value(value).unwrap();
    assert_eq!(decoded, parent);
}

#[test]
fn parent_without_children_field_deserializes_empty_collection() {
    let parent: Parent = serde_json::from_str(r#"{"id":null,"name":"bare"}"#).unwrap();

    assert!(parent.is_new());
    assert!(parent.children.is_empty());
}
