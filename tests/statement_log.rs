//! Statement log queries, output formats and retroactive edits.

use branchdb::{CommitRange, ConnectOptions, Connection, LogEdit, Store, StoreError};
use tempfile::TempDir;

fn test_store(dir: &TempDir) -> Store {
    Store::open_path(dir.path().join("test.db")).unwrap()
}

fn insert_sql(value: &str) -> String {
    format!("insert into t1 values ('{}')", value)
}

fn select(conn: &mut Connection) -> Vec<String> {
    let page = conn.read_page(1).unwrap();
    String::from_utf8(page.to_vec())
        .unwrap()
        .split(',')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// One transaction inserting every value, one statement each.
fn insert_all(conn: &mut Connection, values: &[&str]) -> u64 {
    conn.begin().unwrap();
    for value in values {
        let mut rows = select(conn);
        rows.push(value.to_string());
        conn.write_page(1, rows.join(",").as_bytes()).unwrap();
        conn.log_statement(&insert_sql(value)).unwrap();
    }
    conn.commit().unwrap().unwrap()
}

/// master.1 creates the table, master.2 inserts a and b, dev forks at
/// master.2 and inserts c as dev.3.
fn fixture(store: &Store) -> Connection {
    let mut conn = store.connect(ConnectOptions::branching()).unwrap();
    conn.write_page(1, b"").unwrap();
    conn.log_statement("create table t1(name)").unwrap();
    assert_eq!(conn.commit().unwrap(), Some(1));
    assert_eq!(insert_all(&mut conn, &["a", "b"]), 2);
    conn.execute("pragma new_branch=dev at master.2").unwrap();
    assert_eq!(insert_all(&mut conn, &["c"]), 3);
    conn
}

fn row(branch: &str, commit: u64, text: &str) -> Vec<String> {
    vec![branch.to_string(), commit.to_string(), text.to_string()]
}

// --- Queries ---

#[test]
fn test_log_includes_inherited_history() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let mut conn = fixture(&store);

    let expected = vec![
        row("master", 1, "create table t1(name)"),
        row("master", 2, &insert_sql("a")),
        row("master", 2, &insert_sql("b")),
        row("dev", 3, &insert_sql("c")),
    ];
    assert_eq!(conn.execute("pragma branch_log").unwrap(), expected);
    assert_eq!(conn.execute("pragma branch_log dev").unwrap(), expected);

    assert_eq!(
        conn.execute("pragma branch_log --strict dev").unwrap(),
        vec![row("dev", 3, &insert_sql("c"))]
    );
    assert_eq!(
        conn.execute("pragma branch_log master").unwrap(),
        expected[..3].to_vec()
    );
}

#[test]
fn test_log_ranges() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let mut conn = fixture(&store);

    assert_eq!(conn.execute("pragma branch_log dev.2").unwrap().len(), 2);
    assert_eq!(conn.execute("pragma branch_log dev.2-*").unwrap().len(), 3);
    assert_eq!(
        conn.execute("pragma branch_log dev.*-1").unwrap(),
        vec![row("master", 1, "create table t1(name)")]
    );
    assert_eq!(conn.execute("pragma branch_log dev.3-3").unwrap().len(), 1);
    assert_eq!(conn.execute("pragma branch_log dev.*").unwrap().len(), 4);

    assert!(matches!(
        conn.execute("pragma branch_log dev.5"),
        Err(StoreError::NotFound(_))
    ));
    assert!(matches!(
        conn.execute("pragma branch_log dev.3-1"),
        Err(StoreError::InvalidArgument(_))
    ));
    assert!(conn.execute("pragma branch_log dev.2-9").unwrap().len() == 3);
}

#[test]
fn test_log_follows_pinned_checkout() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let mut conn = fixture(&store);

    conn.checkout("dev.2").unwrap();
    assert_eq!(conn.execute("pragma branch_log").unwrap().len(), 3);
    assert_eq!(conn.execute("pragma branch_log dev").unwrap().len(), 3);

    let rows = conn
        .branch_log(Some("master"), CommitRange::Single(1), false)
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].text, "create table t1(name)");
}

#[test]
fn test_log_formats() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let mut conn = fixture(&store);

    let a = insert_sql("a");
    let b = insert_sql("b");

    let netstring = format!("{}:{},{}:{},", a.len(), a, b.len(), b);
    assert_eq!(
        conn.execute("pragma branch_log --netstring dev.2").unwrap(),
        vec![row("master", 2, &netstring)]
    );

    assert_eq!(
        conn.execute("pragma branch_log --delimited[ | ] dev.2").unwrap(),
        vec![row("master", 2, &format!("{} | {}", a, b))]
    );
    assert_eq!(
        conn.execute(r"pragma branch_log --delimited\t dev.2").unwrap(),
        vec![row("master", 2, &format!("{}\t{}", a, b))]
    );
    assert_eq!(
        conn.execute("pragma branch_log --delimited dev.2").unwrap(),
        vec![row("master", 2, &format!("{}\n{}", a, b))]
    );

    // Grouped formats give one row per commit.
    assert_eq!(
        conn.execute("pragma branch_log --netstring").unwrap().len(),
        3
    );
}

// --- Edits ---

#[test]
fn test_add_statements() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let mut conn = fixture(&store);

    conn.execute("pragma branch_log --add dev.3 insert into t1 values ('z')")
        .unwrap();
    assert_eq!(
        conn.execute("pragma branch_log --strict dev").unwrap(),
        vec![
            row("dev", 3, &insert_sql("c")),
            row("dev", 3, &insert_sql("z")),
        ]
    );

    // The commit after the head is created by the edit.
    conn.execute("pragma branch_log --add dev.4 delete from t1")
        .unwrap();
    assert_eq!(conn.branch_info("dev").unwrap().total_commits, 4);
    assert!(matches!(
        conn.execute("pragma branch_log --add dev.6 delete from t1"),
        Err(StoreError::NotFound(_))
    ));

    // Stored pages are not recomputed.
    assert_eq!(select(&mut conn), vec!["a", "b", "c"]);
}

#[test]
fn test_delete_statements() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let mut conn = fixture(&store);
    insert_all(&mut conn, &["d", "e", "f"]);

    conn.execute("pragma branch_log --del dev.4 1 3").unwrap();
    assert_eq!(
        conn.execute("pragma branch_log dev.4").unwrap(),
        vec![row("dev", 4, &insert_sql("e"))]
    );
    assert!(matches!(
        conn.execute("pragma branch_log --del dev.4 2"),
        Err(StoreError::NotFound(_))
    ));
    assert!(matches!(
        conn.execute("pragma branch_log --del dev.5 1"),
        Err(StoreError::NotFound(_))
    ));
}

#[test]
fn test_set_statements() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let mut conn = fixture(&store);

    conn.execute("pragma branch_log --set dev.3 update t1 set name='x'")
        .unwrap();
    assert_eq!(
        conn.execute("pragma branch_log dev.3").unwrap(),
        vec![row("dev", 3, "update t1 set name='x'")]
    );

    conn.execute("pragma branch_log --netstring --set dev.3 1:x,1:y, dev.4 1:z,")
        .unwrap();
    assert_eq!(
        conn.execute("pragma branch_log --strict dev").unwrap(),
        vec![row("dev", 3, "x"), row("dev", 3, "y"), row("dev", 4, "z")]
    );
    assert_eq!(conn.branch_info("dev").unwrap().total_commits, 4);
}

#[test]
fn test_fork_points_are_locked() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let mut conn = fixture(&store);

    for command in [
        "pragma branch_log --add master.2 delete from t1",
        "pragma branch_log --add master.1 delete from t1",
        "pragma branch_log --del master.2 1",
        "pragma branch_log --set master.1 drop table t1",
    ] {
        assert!(
            matches!(
                conn.execute(command),
                Err(StoreError::ForkPointLocked { .. })
            ),
            "{} should be locked",
            command
        );
    }

    // Past the fork point the parent can still be extended.
    conn.edit_log(&LogEdit::Add {
        branch: "master".into(),
        commit: 3,
        statements: vec!["delete from t1".into()],
    })
    .unwrap();
    assert_eq!(conn.branch_info("master").unwrap().total_commits, 3);
    assert_eq!(conn.execute("pragma branch_log --strict master").unwrap().len(), 4);

    // A failed multi-entry set changes nothing.
    assert!(conn
        .execute("pragma branch_log --netstring --set master.3 1:x, master.2 1:y,")
        .is_err());
    assert_eq!(
        conn.execute("pragma branch_log master.3").unwrap(),
        vec![row("master", 3, "delete from t1")]
    );
}

#[test]
fn test_edits_rejected_without_branching() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let mut conn = store.connect(ConnectOptions::default()).unwrap();
    assert!(matches!(
        conn.execute("pragma branch_log"),
        Err(StoreError::BranchesDisabled)
    ));
    assert!(matches!(
        conn.execute("pragma branch_log --add master.1 x"),
        Err(StoreError::BranchesDisabled)
    ));
}
