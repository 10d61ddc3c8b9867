use lifecycle_core::db::open_db_in_memory;
use lifecycle_core::{
    Child, ChildRepository, CrudRepository, EntityManager, Parent, ParentRepository,
    PersistError,
};

#[test]
fn count_and_exists_reflect_saved_rows() {
    let conn = open_db_in_memory().unwrap();
    let em = EntityManager::try_new(&conn).unwrap();
    let repo = ParentRepository::new(&em);

    assert_eq!(repo.count().unwrap(), 0);
    repo.save_all(vec![Parent::new("one"), Parent::new("two")])
        .unwrap();

    assert_eq!(repo.count().unwrap(), 2);
    assert!(repo.exists_by_id(1).unwrap());
    assert!(repo.exists_by_id(2).unwrap());
    assert!(!repo.exists_by_id(3).unwrap());
}

#[test]
fn find_all_returns_rows_ordered_by_id() {
    let conn = open_db_in_memory().unwrap();
    let em = EntityManager::try_new(&conn).unwrap();
    let repo = ChildRepository::new(&em);
    repo.save(Child::builder().id(30).name("late").build())
        .unwrap();
    repo.save(Child::builder().id(10).name("early").build())
        .unwrap();

    let names: Vec<String> = repo
        .find_all()
        .unwrap()
        .iter()
        .map(|child| child.read().name.clone())
        .collect();

    assert_eq!(names, vec!["early".to_string(), "late".to_string()]);
}

#[test]
fn find_all_includes_children_owned_by_a_parent() {
    let conn = open_db_in_memory().unwrap();
    let em = EntityManager::try_new(&conn).unwrap();
    let mut parent = Parent::new("owner");
    parent.add_child(Child::new("owned"));
    ParentRepository::new(&em).save(parent).unwrap();
    ChildRepository::new(&em)
        .save(Child::new("free"))
        .unwrap();

    em.begin().unwrap();
    em.find::<Parent>(1).unwrap().unwrap();
    let children = ChildRepository::new(&em).find_all().unwrap();
    em.commit().unwrap();

    assert_eq!(children.len(), 2);
    assert_eq!(children[0].read().parent_id(), Some(1));
    assert_eq!(children[1].read().parent_id(), None);
}

#[test]
fn delete_by_id_removes_row_and_reports_missing_ids() {
    let conn = open_db_in_memory().unwrap();
    let em = EntityManager::try_new(&conn).unwrap();
    let repo = ChildRepository::new(&em);
    repo.save(Child::new("doomed")).unwrap();

    repo.delete_by_id(1).unwrap();
    assert_eq!(repo.count().unwrap(), 0);

    let err = repo.delete_by_id(1).unwrap_err();
    assert!(
        matches!(err, PersistError::EntityNotFound { table: "child", id: 1 }),
        "unexpected error: {err}"
    );
}

#[test]
fn delete_ignores_transient_entities() {
    let conn = open_db_in_memory().unwrap();
    let em = EntityManager::try_new(&conn).unwrap();
    let repo = ParentRepository::new(&em);
    let saved = repo.save(Parent::new("kept")).unwrap();

    repo.delete(&Parent::new("never saved")).unwrap();
    assert_eq!(repo.count().unwrap(), 1);

    repo.delete(&saved.snapshot()).unwrap();
    assert_eq!(repo.count().unwrap(), 0);
}

#[test]
fn delete_all_children_then_parents_empties_storage() {
    let conn = open_db_in_memory().unwrap();
    let em = EntityManager::try_new(&conn).unwrap();
    let parents = ParentRepository::new(&em);
    let children = ChildRepository::new(&em);
    let mut parent = Parent::new("owner");
    parent.add_child(Child::new("a"));
    parent.add_child(Child::new("b"));
    parents.save(parent).unwrap();

    let err = parents.delete_all().unwrap_err();
    assert!(matches!(err, PersistError::ConstraintViolation(_)));
    assert_eq!(parents.count().unwrap(), 1);

    children.delete_all().unwrap();
    parents.delete_all().unwrap();
    assert_eq!(children.count().unwrap(), 0);
    assert_eq!(parents.count().unwrap(), 0);
}

#[test]
fn delete_all_detaches_managed_instances() {
    let conn = open_db_in_memory().unwrap();
    let em = EntityManager::try_new(&conn).unwrap();

    em.begin().unwrap();
    let child = em.persist(Child::new("tracked")).unwrap();
    ChildRepository::new(&em).delete_all().unwrap();
    assert!(!child.is_attached());
    em.commit().unwrap();

    assert_eq!(ChildRepository::new(&em).count().unwrap(), 0);
}

#[test]
fn calls_inside_active_scope_return_managed_handles() {
    let conn = open_db_in_memory().unwrap();
    let em = EntityManager::try_new(&conn).unwrap();
    let repo = ParentRepository::new(&em);

    em.begin().unwrap();
    let saved = repo.save(Parent::new("managed")).unwrap();
    let found = repo.find_by_id(1).unwrap().unwrap();
    assert!(saved.is_attached());
    assert!(found.ptr_eq(&saved));
    em.rollback().unwrap();

    assert_eq!(repo.count().unwrap(), 0);
}

#[test]
fn failed_call_outside_scope_leaves_no_scope_open() {
    let conn = open_db_in_memory().unwrap();
    let em = EntityManager::try_new(&conn).unwrap();
    let repo = ChildRepository::new(&em);

    let orphan = Child::builder()
        .name("dangling")
        .parent(&Parent::new("unsaved"))
        .build();
    let err = repo.save(orphan).unwrap_err();

    assert!(matches!(err, PersistError::TransientReference { .. }));
    assert!(!em.in_transaction());
    assert_eq!(repo.count().unwrap(), 0);
}

#[test]
fn call_outside_scope_keeps_previously_managed_entities_attached() {
    let conn = open_db_in_memory().unwrap();
    let em = EntityManager::try_new(&conn).unwrap();
    let parent = em.persist(Parent::new("before")).unwrap();

    assert_eq!(ChildRepository::new(&em).count().unwrap(), 0);
    assert!(parent.is_attached());

    parent.write().name = "after".to_string();
    em.flush().unwrap();
    let found = ParentRepository::new(&em).find_by_id(1).unwrap().unwrap();
    assert!(found.ptr_eq(&parent));
    assert_eq!(found.read().name, "after");
}

#[test]
fn call_outside_scope_detaches_only_what_it_loaded() {
    let conn = open_db_in_memory().unwrap();
    let em = EntityManager::try_new(&conn).unwrap();
    let kept = em.persist(Child::new("kept")).unwrap();
    ChildRepository::new(&em)
        .save(Child::new("loaded later"))
        .unwrap();
    em.clear();
    let kept_again = em.find::<Child>(kept.id().unwrap()).unwrap().unwrap();

    let loaded = ChildRepository::new(&em).find_by_id(2).unwrap().unwrap();

    assert!(kept_again.is_attached());
    assert!(!loaded.is_attached());
    assert_eq!(em.managed_count(), 1);
}
