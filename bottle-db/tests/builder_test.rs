use bottle_db::{Connection, ConnectionConfig, Direction, LikeSide, Outcome, Value};
use serde::Deserialize;

#[derive(Debug, Deserialize, PartialEq)]
struct User {
    id: i64,
    name: String,
    age: Option<i64>,
    team: Option<String>,
}

async fn seeded() -> Result<Connection, Box<dyn std::error::Error>> {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut conn = Connection::new(ConnectionConfig::from_dsn("sqlite::memory:")?)?;
    conn.query(
        "CREATE TABLE users (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT NOT NULL, age INTEGER, team TEXT)",
        (),
    )
    .await?;

    let inserted = conn
        .table("users")?
        .insert_batch(
            vec![
                vec![("name", Value::from("Ada")), ("age", Value::from(36)), ("team", Value::from("core"))],
                vec![("name", Value::from("Linus")), ("age", Value::from(28)), ("team", Value::from("kernel"))],
                vec![("name", Value::from("Grace")), ("age", Value::from(45)), ("team", Value::from("core"))],
                vec![("name", Value::from("Ken")), ("age", Value::Null), ("team", Value::from("kernel"))],
            ],
            3,
        )
        .await?;
    assert_eq!(inserted, 4);

    Ok(conn)
}

#[tokio::test]
async fn test_result_fields_carry_table_flags() -> Result<(), Box<dyn std::error::Error>> {
    let mut conn = seeded().await?;

    let rows = conn.table("users")?.select("id, name, age").get().await?.into_result()?;
    let fields = rows.get_field_data();
    assert_eq!(fields.len(), 3);
    assert!(fields[0].primary_key);
    assert!(!fields[1].primary_key && !fields[1].nullable);
    assert!(!fields[2].primary_key && fields[2].nullable);

    let none = conn.table("users")?.select("id").where_("id", 99).get().await?.into_result()?;
    assert_eq!(none.get_num_rows(), 0);
    assert!(none.get_field_data()[0].primary_key);

    let counted = conn.query("SELECT COUNT(*) AS total FROM users", ()).await?.into_result()?;
    assert!(!counted.get_field_data()[0].primary_key);
    Ok(())
}

#[tokio::test]
async fn test_insert_update_delete_round_trip() -> Result<(), Box<dyn std::error::Error>> {
    let mut conn = seeded().await?;

    let outcome = conn.table("users")?.insert([("name", Value::from("Barbara")), ("age", Value::from(52))]).await?;
    assert_eq!(outcome.affected_rows(), 1);
    assert_eq!(conn.insert_id().await?, Some(5));

    conn.table("users")?.where_("name", "Barbara").update([("team", "research")]).await?;
    let mut rows = conn.table("users")?.where_("id", 5).get().await?.into_result()?;
    let row = rows.get_first_row().ok_or("missing row")?;
    assert_eq!(row.get_text("team").as_deref(), Some("research"));

    conn.table("users")?.delete_where([("id", 5)]).await?;
    assert_eq!(conn.table("users")?.count_all().await?, 4);
    Ok(())
}

#[tokio::test]
async fn test_grouped_conditions_and_like() -> Result<(), Box<dyn std::error::Error>> {
    let mut conn = seeded().await?;

    let count = conn
        .table("users")?
        .where_("team", "core")
        .group_start()
        .where_("age >", 40)
        .or_like("name", "ad", LikeSide::Both)
        .group_end()
        .count_all_results(true)
        .await?;
    assert_eq!(count, 2);

    let mut rows = conn
        .table("users")?
        .select("name")
        .where_in("name", ["Ada", "Ken", "Nobody"])
        .where_("age", Value::Null)
        .get()
        .await?
        .into_result()?;
    assert_eq!(rows.get_num_rows(), 1);
    assert_eq!(rows.get_first_row().and_then(|r| r.get_text("name")).as_deref(), Some("Ken"));
    Ok(())
}

#[tokio::test]
async fn test_aggregates_per_group() -> Result<(), Box<dyn std::error::Error>> {
    let mut conn = seeded().await?;

    let result = conn
        .table("users")?
        .select("team")
        .select_count("id", Some("members"))
        .select_max("age", Some("oldest"))
        .group_by("team")
        .having("members >", 1)
        .order_by("team", Direction::Asc)
        .get()
        .await?
        .into_result()?;

    let rows = result.get_result();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].get_text("team").as_deref(), Some("core"));
    assert_eq!(rows[0].get_i64("members"), Some(2));
    assert_eq!(rows[0].get_i64("oldest"), Some(45));
    assert_eq!(rows[1].get_i64("oldest"), Some(28));
    Ok(())
}

#[tokio::test]
async fn test_result_cursor_and_deserialization() -> Result<(), Box<dyn std::error::Error>> {
    let mut conn = seeded().await?;

    let mut result = conn.table("users")?.order_by("id", Direction::Asc).limit(3).get().await?.into_result()?;
    assert_eq!(result.get_field_names().to_vec(), vec!["id", "name", "age", "team"]);

    assert_eq!(result.get_first_row().and_then(|r| r.get_text("name")).as_deref(), Some("Ada"));
    assert_eq!(result.get_next_row().and_then(|r| r.get_text("name")).as_deref(), Some("Linus"));
    assert_eq!(result.get_last_row().and_then(|r| r.get_text("name")).as_deref(), Some("Grace"));
    assert!(result.get_next_row().is_none());
    assert_eq!(result.get_previous_row().and_then(|r| r.get_text("name")).as_deref(), Some("Linus"));

    let users: Vec<User> = result.get_result_as()?;
    assert_eq!(
        users[1],
        User { id: 2, name: "Linus".to_string(), age: Some(28), team: Some("kernel".to_string()) }
    );

    let page = conn.table("users")?.get_where([("team", "kernel")], Some(1), Some(1)).await?.into_result()?;
    let kernel: Vec<User> = page.get_result_as()?;
    assert_eq!(kernel.len(), 1);
    assert_eq!(kernel[0].name, "Ken");
    assert_eq!(kernel[0].age, None);
    Ok(())
}

#[tokio::test]
async fn test_increment_and_replace() -> Result<(), Box<dyn std::error::Error>> {
    let mut conn = seeded().await?;

    conn.table("users")?.where_("name", "Ada").increment("age", 2).await?;
    conn.table("users")?.where_("name", "Linus").decrement("age", 3).await?;

    let mut rows = conn.table("users")?.where_in("id", [1, 2]).order_by("id", Direction::Asc).get().await?.into_result()?;
    assert_eq!(rows.get_row(0).and_then(|r| r.get_i64("age")), Some(38));
    assert_eq!(rows.get_row(1).and_then(|r| r.get_i64("age")), Some(25));

    conn.table("users")?
        .replace([("id", Value::from(4)), ("name", Value::from("Ken")), ("age", Value::from(80))])
        .await?;
    let mut ken = conn.table("users")?.where_("id", 4).get().await?.into_result()?;
    assert_eq!(ken.get_first_row().and_then(|r| r.get_i64("age")), Some(80));
    assert_eq!(conn.table("users")?.count_all().await?, 4);
    Ok(())
}

#[tokio::test]
async fn test_unfiltered_delete_is_refused() -> Result<(), Box<dyn std::error::Error>> {
    let mut conn = seeded().await?;

    assert!(conn.table("users")?.delete().await.is_err());
    assert_eq!(conn.table("users")?.count_all().await?, 4);

    conn.table("users")?.empty_table().await?;
    assert_eq!(conn.table("users")?.count_all().await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_pretend_mode_compiles_without_running() -> Result<(), Box<dyn std::error::Error>> {
    let mut conn = seeded().await?;
    conn.pretend(true);

    let outcome = conn.table("users")?.where_("name", "Ada").delete().await?;
    match outcome {
        Outcome::Pretend(query) => assert_eq!(query.get_query(), "DELETE FROM \"users\" WHERE \"name\" = 'Ada'"),
        other => panic!("unexpected outcome {:?}", other),
    }

    conn.pretend(false);
    assert_eq!(conn.table("users")?.count_all().await?, 4);
    Ok(())
}
