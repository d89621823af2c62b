use std::collections::BTreeMap;

use bottle_db::{Connection, ConnectionConfig, Field, IndexType, Value};

fn file_connection(dir: &tempfile::TempDir) -> Result<Connection, Box<dyn std::error::Error>> {
    let _ = env_logger::builder().is_test(true).try_init();
    let path = dir.path().join("app.db");
    let dsn = format!("sqlite:{}?prefix=app_&foreign_keys=on", path.display());
    Ok(Connection::new(ConnectionConfig::from_dsn(&dsn)?)?)
}

async fn create_schema(conn: &mut Connection) -> Result<(), Box<dyn std::error::Error>> {
    let mut forge = conn.forge();
    forge
        .add_field(Field::new("id", "INT").unsigned().auto_increment())
        .add_field(Field::new("name", "VARCHAR").constraint(60))
        .add_field(Field::new("status", "VARCHAR").constraint(10).default_value("active"))
        .add_field(Field::new("motto", "TEXT").null(true))
        .add_unique_key(&["name"]);
    assert!(forge.create_table("teams", true, &BTreeMap::new()).await?);

    forge
        .add_field(Field::new("id", "INT").auto_increment())
        .add_field(Field::new("team_id", "INT"))
        .add_field(Field::new("email", "VARCHAR").constraint(120))
        .add_foreign_key(&["team_id"], "teams", &["id"], None, Some("cascade"));
    assert!(forge.create_table("players", false, &BTreeMap::new()).await?);
    Ok(())
}

#[tokio::test]
async fn test_tables_are_created_with_prefix() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let mut conn = file_connection(&dir)?;
    create_schema(&mut conn).await?;

    let mut tables = conn.list_tables(true).await?;
    tables.sort();
    assert_eq!(tables, vec!["app_players", "app_teams"]);
    assert!(conn.table_exists("teams", false).await?);
    assert!(conn.field_exists("team_id", "players").await?);

    let fields = conn.get_field_data("teams").await?;
    let names: Vec<&str> = fields.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["id", "name", "status", "motto"]);
    assert!(fields[0].primary_key);
    assert_eq!(fields[1].max_length, Some(60));
    assert!(!fields[1].nullable);
    assert_eq!(fields[2].default.as_deref(), Some("'active'"));
    assert!(fields[3].nullable);
    Ok(())
}

#[tokio::test]
async fn test_keys_are_introspected() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let mut conn = file_connection(&dir)?;
    create_schema(&mut conn).await?;

    let indexes = conn.get_index_data("teams").await?;
    let primary = indexes.iter().find(|i| i.index_type == IndexType::Primary).ok_or("no primary key")?;
    assert_eq!(primary.fields, vec!["id"]);
    let unique = indexes.iter().find(|i| i.name == "app_teams_name").ok_or("no unique key")?;
    assert_eq!(unique.index_type, IndexType::Unique);

    let foreign = conn.get_foreign_key_data("players").await?;
    assert_eq!(foreign.len(), 1);
    assert_eq!(foreign[0].constraint_name, "app_players_team_id_foreign");
    assert_eq!(foreign[0].foreign_table_name, "app_teams");
    assert_eq!(foreign[0].column_name, vec!["team_id"]);
    assert_eq!(foreign[0].on_delete.as_deref(), Some("CASCADE"));

    conn.table("teams")?.insert([("name", "core")]).await?;
    conn.table("players")?.insert([("team_id", Value::from(1)), ("email", Value::from("a@example.com"))]).await?;
    assert!(conn.query("INSERT INTO app_players (team_id, email) VALUES (99, 'x@example.com')", ()).await.is_err());
    Ok(())
}

#[tokio::test]
async fn test_alter_and_drop() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let mut conn = file_connection(&dir)?;
    create_schema(&mut conn).await?;

    {
        let mut forge = conn.forge();
        assert!(forge.add_column("teams", vec![Field::new("founded", "INT").null(true)]).await?);
        assert!(forge.drop_column("teams", &["motto"]).await.is_err());
        assert!(forge.modify_column("teams", vec![Field::new("name", "TEXT")]).await.is_err());
        assert!(forge.rename_table("players", "members").await?);
        assert!(forge.drop_table("members", true, false).await?);
    }

    assert!(conn.field_exists("founded", "teams").await?);
    assert!(conn.table_exists("teams", true).await?);
    assert!(!conn.table_exists("players", true).await?);
    assert!(!conn.table_exists("members", false).await?);
    Ok(())
}

#[tokio::test]
async fn test_database_file_is_dropped() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("scratch.db");
    let dsn = format!("sqlite:{}", path.display());
    let mut conn = Connection::new(ConnectionConfig::from_dsn(&dsn)?)?;
    conn.query("CREATE TABLE t (id INTEGER)", ()).await?;
    conn.close().await?;
    assert!(path.exists());

    let file = path.to_string_lossy().to_string();
    assert!(conn.forge().drop_database(&file).await?);
    assert!(!path.exists());
    Ok(())
}
