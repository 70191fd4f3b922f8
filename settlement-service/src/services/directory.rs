//! Shops and their participants.

use crate::error::SettlementError;
use crate::models::{CreateShop, CreateUser, Shop, User, UserRole};
use crate::services::db_error;
use crate::services::metrics::DB_QUERY_DURATION;
use sqlx::PgConnection;
use tracing::{info, instrument};
use uuid::Uuid;

const USER_COLUMNS: &str =
    "user_id, shop_id, username, role, balance, cumulative_value, created_utc";

/// Create a shop and its owner in one go.
#[instrument(skip(conn, input), fields(name = %input.name))]
pub async fn create_shop(
    conn: &mut PgConnection,
    input: &CreateShop,
) -> Result<(Shop, User), SettlementError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["create_shop"])
        .start_timer();

    let shop_id = Uuid::new_v4();
    sqlx::query("INSERT INTO shops (shop_id, name) VALUES ($1, $2)")
        .bind(shop_id)
        .bind(&input.name)
        .execute(&mut *conn)
        .await
        .map_err(db_error("Failed to create shop"))?;

    let owner = insert_user(&mut *conn, shop_id, &input.owner_username, UserRole::Owner).await?;

    let shop = sqlx::query_as::<_, Shop>(
        r#"
        UPDATE shops SET owner_id = $2 WHERE shop_id = $1
        RETURNING shop_id, owner_id, name, created_utc
        "#,
    )
    .bind(shop_id)
    .bind(owner.user_id)
    .fetch_one(&mut *conn)
    .await
    .map_err(db_error("Failed to assign shop owner"))?;

    timer.observe_duration();
    info!(shop_id = %shop.shop_id, owner_id = %owner.user_id, "Shop created");

    Ok((shop, owner))
}

/// Register a farmer or buyer under an existing shop.
#[instrument(skip(conn, input), fields(shop_id = %input.shop_id, role = %input.role))]
pub async fn create_user(
    conn: &mut PgConnection,
    input: &CreateUser,
) -> Result<User, SettlementError> {
    if input.role == UserRole::Owner {
        return Err(SettlementError::invalid(
            "role",
            "owners are created together with their shop",
        ));
    }
    get_shop(&mut *conn, input.shop_id).await?;
    let user = insert_user(conn, input.shop_id, &input.username, input.role).await?;
    info!(user_id = %user.user_id, "User created");
    Ok(user)
}

async fn insert_user(
    conn: &mut PgConnection,
    shop_id: Uuid,
    username: &str,
    role: UserRole,
) -> Result<User, SettlementError> {
    let sql = format!(
        "INSERT INTO users (user_id, shop_id, username, role) VALUES ($1, $2, $3, $4) RETURNING {}",
        USER_COLUMNS
    );
    sqlx::query_as::<_, User>(&sql)
        .bind(Uuid::new_v4())
        .bind(shop_id)
        .bind(username)
        .bind(role.as_str())
        .fetch_one(conn)
        .await
        .map_err(db_error("Failed to create user"))
}

pub async fn get_shop(conn: &mut PgConnection, shop_id: Uuid) -> Result<Shop, SettlementError> {
    sqlx::query_as::<_, Shop>(
        "SELECT shop_id, owner_id, name, created_utc FROM shops WHERE shop_id = $1",
    )
    .bind(shop_id)
    .fetch_optional(conn)
    .await
    .map_err(db_error("Failed to get shop"))?
    .ok_or_else(|| SettlementError::not_found("shop", shop_id))
}

pub async fn get_user(conn: &mut PgConnection, user_id: Uuid) -> Result<User, SettlementError> {
    let sql = format!("SELECT {} FROM users WHERE user_id = $1", USER_COLUMNS);
    sqlx::query_as::<_, User>(&sql)
        .bind(user_id)
        .fetch_optional(conn)
        .await
        .map_err(db_error("Failed to get user"))?
        .ok_or_else(|| SettlementError::not_found("user", user_id))
}

/// Row-lock a user for the rest of the transaction.
pub async fn lock_user(conn: &mut PgConnection, user_id: Uuid) -> Result<User, SettlementError> {
    let sql = format!(
        "SELECT {} FROM users WHERE user_id = $1 FOR UPDATE",
        USER_COLUMNS
    );
    sqlx::query_as::<_, User>(&sql)
        .bind(user_id)
        .fetch_optional(conn)
        .await
        .map_err(db_error("Failed to lock user"))?
        .ok_or_else(|| SettlementError::not_found("user", user_id))
}

/// A user that must belong to `shop_id` with the given role.
pub async fn expect_member(
    conn: &mut PgConnection,
    shop_id: Uuid,
    user_id: Uuid,
    role: UserRole,
    field: &'static str,
) -> Result<User, SettlementError> {
    let user = get_user(conn, user_id).await?;
    if user.shop_id != Some(shop_id) {
        return Err(SettlementError::invalid(field, "user does not belong to this shop"));
    }
    if user.parsed_role() != Some(role) {
        return Err(SettlementError::invalid(
            field,
            format!("user is not a {}", role),
        ));
    }
    Ok(user)
}

/// Farmers and buyers of a shop; owners carry no derived balance.
pub async fn list_balance_holders(
    conn: &mut PgConnection,
    shop_id: Uuid,
) -> Result<Vec<User>, SettlementError> {
    let sql = format!(
        "SELECT {} FROM users WHERE shop_id = $1 AND role IN ('farmer', 'buyer') ORDER BY created_utc, user_id",
        USER_COLUMNS
    );
    sqlx::query_as::<_, User>(&sql)
        .bind(shop_id)
        .fetch_all(conn)
        .await
        .map_err(db_error("Failed to list shop users"))
}
