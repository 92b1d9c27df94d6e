use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{
    CartId, CartItemId, CouponId, MerchantId, OrderId, PaymentId, ProductId, ShipmentId, ShopperId,
    VariantId,
};
use domain::{
    Cart, CartItem, CartStatus, Coupon, Merchant, Money, Order, OrderLine, OrderStatus,
    OrderTotals, Payment, Product, Shipment, Shopper,
};
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    Result, StoreError,
    store::{CartStore, CatalogStore, OrderStore, StockChange},
};

const ACTIVE_CART_INDEX: &str = "carts_one_active_per_pair";

/// PostgreSQL-backed store implementation.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Creates a new PostgreSQL store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations (commerce and queue tables).
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        tracing::info!("database migrations applied");
        Ok(())
    }

    fn row_to_cart(row: &PgRow) -> Result<Cart> {
        let status: String = row.try_get("status")?;
        Ok(Cart {
            id: CartId::from_uuid(row.try_get("id")?),
            shopper_id: ShopperId::from_uuid(row.try_get("shopper_id")?),
            merchant_id: MerchantId::from_uuid(row.try_get("merchant_id")?),
            status: status.parse().map_err(StoreError::Corrupt)?,
            total_amount: Money::new(row.try_get("total_amount")?),
            shipping_cost: Money::new(row.try_get("shipping_cost")?),
            discount_amount: Money::new(row.try_get("discount_amount")?),
            notes: row.try_get("notes")?,
            timeout_days: to_u32(row.try_get("timeout_days")?, "timeout_days")?,
            stock_held: row.try_get("stock_held")?,
            expires_at: row.try_get("expires_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            version: row.try_get("version")?,
        })
    }

    fn row_to_item(row: &PgRow) -> Result<CartItem> {
        Ok(CartItem {
            id: CartItemId::from_uuid(row.try_get("id")?),
            cart_id: CartId::from_uuid(row.try_get("cart_id")?),
            product_id: ProductId::from_uuid(row.try_get("product_id")?),
            variant_id: row
                .try_get::<Option<Uuid>, _>("variant_id")?
                .map(VariantId::from_uuid),
            quantity: to_u32(row.try_get("quantity")?, "quantity")?,
            unit_price: Money::new(row.try_get("unit_price")?),
            subtotal: Money::new(row.try_get("subtotal")?),
            created_at: row.try_get("created_at")?,
        })
    }

    fn row_to_product(row: &PgRow) -> Result<Product> {
        Ok(Product {
            id: ProductId::from_uuid(row.try_get("id")?),
            merchant_id: MerchantId::from_uuid(row.try_get("merchant_id")?),
            name: row.try_get("name")?,
            price: Money::new(row.try_get("price")?),
            stock: to_u32(row.try_get("stock")?, "stock")?,
            image_url: row.try_get("image_url")?,
        })
    }

    fn row_to_coupon(row: &PgRow) -> Result<Coupon> {
        let scope: Vec<Uuid> = row.try_get("product_scope")?;
        Ok(Coupon {
            id: CouponId::from_uuid(row.try_get("id")?),
            merchant_id: MerchantId::from_uuid(row.try_get("merchant_id")?),
            code: row.try_get("code")?,
            discount: serde_json::from_value(row.try_get("discount")?)?,
            active: row.try_get("active")?,
            expires_at: row.try_get("expires_at")?,
            product_scope: scope.into_iter().map(ProductId::from_uuid).collect(),
        })
    }

    fn row_to_payment(row: &PgRow) -> Result<Payment> {
        let outcome: String = row.try_get("outcome")?;
        let split: Option<serde_json::Value> = row.try_get("split")?;
        Ok(Payment {
            id: PaymentId::from_uuid(row.try_get("id")?),
            order_id: OrderId::from_uuid(row.try_get("order_id")?),
            external_reference: row.try_get("external_reference")?,
            receipt_number: row.try_get("receipt_number")?,
            amount: Money::new(row.try_get("amount")?),
            status: row.try_get("status")?,
            outcome: outcome.parse().map_err(StoreError::Corrupt)?,
            response: row.try_get("response")?,
            raw_response: row.try_get("raw_response")?,
            split: split.map(serde_json::from_value).transpose()?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_shipment(row: &PgRow) -> Result<Shipment> {
        Ok(Shipment {
            id: ShipmentId::from_uuid(row.try_get("id")?),
            order_id: OrderId::from_uuid(row.try_get("order_id")?),
            carrier: row.try_get("carrier")?,
            tracking_number: row.try_get("tracking_number")?,
            label_url: row.try_get("label_url")?,
            status: row.try_get("status")?,
            message: row.try_get("message")?,
            created_at: row.try_get("created_at")?,
        })
    }

    async fn fetch_carts(&self, sql: &str, binds: &[DateTime<Utc>]) -> Result<Vec<Cart>> {
        let mut query = sqlx::query(sql);
        for bind in binds {
            query = query.bind(*bind);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_cart).collect()
    }
}

fn to_u32(value: i32, column: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative {column}: {value}")))
}

fn to_i32(value: u32) -> Result<i32> {
    i32::try_from(value).map_err(|_| StoreError::Corrupt(format!("value out of range: {value}")))
}

fn map_unique_violation(err: sqlx::Error, message: impl FnOnce() -> String) -> StoreError {
    if let sqlx::Error::Database(ref db_err) = err
        && db_err.is_unique_violation()
    {
        return StoreError::Conflict(message());
    }
    StoreError::Database(err)
}

/// Versioned UPDATE of a cart row, returning the number of rows written.
async fn update_cart<'e, E>(executor: E, cart: &Cart) -> Result<u64>
where
    E: sqlx::PgExecutor<'e>,
{
    let result = sqlx::query(
        r#"
        UPDATE carts
        SET status = $2, total_amount = $3, shipping_cost = $4, discount_amount = $5,
            notes = $6, timeout_days = $7, stock_held = $8, expires_at = $9, updated_at = $10,
            version = version + 1
        WHERE id = $1 AND version = $11
        "#,
    )
    .bind(cart.id.as_uuid())
    .bind(cart.status.as_str())
    .bind(cart.total_amount.amount())
    .bind(cart.shipping_cost.amount())
    .bind(cart.discount_amount.amount())
    .bind(&cart.notes)
    .bind(to_i32(cart.timeout_days)?)
    .bind(cart.stock_held)
    .bind(cart.expires_at)
    .bind(cart.updated_at)
    .bind(cart.version)
    .execute(executor)
    .await
    .map_err(|e| {
        if let sqlx::Error::Database(ref db_err) = e
            && db_err.constraint() == Some(ACTIVE_CART_INDEX)
        {
            return StoreError::Conflict(format!(
                "shopper {} already has an active cart for merchant {}",
                cart.shopper_id, cart.merchant_id
            ));
        }
        StoreError::Database(e)
    })?;
    Ok(result.rows_affected())
}

fn cart_conflict(cart: &Cart) -> StoreError {
    StoreError::ConcurrencyConflict {
        entity: "cart",
        id: cart.id.to_string(),
        expected: format!("version {}", cart.version),
    }
}

async fn upsert_item<'e, E>(executor: E, item: &CartItem) -> Result<()>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO cart_items (id, cart_id, product_id, variant_id, quantity, unit_price,
                                subtotal, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (id) DO UPDATE SET quantity = $5, unit_price = $6, subtotal = $7
        "#,
    )
    .bind(item.id.as_uuid())
    .bind(item.cart_id.as_uuid())
    .bind(item.product_id.as_uuid())
    .bind(item.variant_id.map(|v| v.as_uuid()))
    .bind(to_i32(item.quantity)?)
    .bind(item.unit_price.amount())
    .bind(item.subtotal.amount())
    .bind(item.created_at)
    .execute(executor)
    .await?;
    Ok(())
}

const CART_COLUMNS: &str = "id, shopper_id, merchant_id, status, total_amount, shipping_cost, \
     discount_amount, notes, timeout_days, stock_held, expires_at, created_at, updated_at, version";

#[async_trait]
impl CatalogStore for PostgresStore {
    async fn save_merchant(&self, merchant: &Merchant) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO merchants (id, name, slug, config)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE SET name = $2, slug = $3, config = $4
            "#,
        )
        .bind(merchant.id.as_uuid())
        .bind(&merchant.name)
        .bind(&merchant.slug)
        .bind(serde_json::to_value(merchant.config)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_merchant(&self, id: MerchantId) -> Result<Option<Merchant>> {
        let row = sqlx::query("SELECT id, name, slug, config FROM merchants WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| -> Result<Merchant> {
            Ok(Merchant {
                id: MerchantId::from_uuid(row.try_get("id")?),
                name: row.try_get("name")?,
                slug: row.try_get("slug")?,
                config: serde_json::from_value(row.try_get("config")?)?,
            })
        })
        .transpose()
    }

    async fn save_shopper(&self, shopper: &Shopper) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO shoppers (id, name, phone, email, address, city)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE
            SET name = $2, phone = $3, email = $4, address = $5, city = $6
            "#,
        )
        .bind(shopper.id.as_uuid())
        .bind(&shopper.name)
        .bind(&shopper.phone)
        .bind(&shopper.email)
        .bind(&shopper.address)
        .bind(&shopper.city)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_shopper(&self, id: ShopperId) -> Result<Option<Shopper>> {
        let row = sqlx::query(
            "SELECT id, name, phone, email, address, city FROM shoppers WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| -> Result<Shopper> {
            Ok(Shopper {
                id: ShopperId::from_uuid(row.try_get("id")?),
                name: row.try_get("name")?,
                phone: row.try_get("phone")?,
                email: row.try_get("email")?,
                address: row.try_get("address")?,
                city: row.try_get("city")?,
            })
        })
        .transpose()
    }

    async fn save_product(&self, product: &Product) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO products (id, merchant_id, name, price, stock, image_url)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE
            SET name = $3, price = $4, stock = $5, image_url = $6
            "#,
        )
        .bind(product.id.as_uuid())
        .bind(product.merchant_id.as_uuid())
        .bind(&product.name)
        .bind(product.price.amount())
        .bind(to_i32(product.stock)?)
        .bind(&product.image_url)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_product(&self, id: ProductId) -> Result<Option<Product>> {
        let row = sqlx::query(
            "SELECT id, merchant_id, name, price, stock, image_url FROM products WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_product).transpose()
    }

    async fn try_decrement_stock(&self, id: ProductId, quantity: u32) -> Result<StockChange> {
        // Single conditional UPDATE: the row lock makes check-and-decrement atomic.
        let quantity = to_i32(quantity)?;
        let remaining: Option<i32> = sqlx::query_scalar(
            "UPDATE products SET stock = stock - $2 WHERE id = $1 AND stock >= $2 RETURNING stock",
        )
        .bind(id.as_uuid())
        .bind(quantity)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(remaining) = remaining {
            return Ok(StockChange::Applied {
                remaining: to_u32(remaining, "stock")?,
            });
        }

        let available: Option<i32> = sqlx::query_scalar("SELECT stock FROM products WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        match available {
            Some(available) => Ok(StockChange::Insufficient {
                available: to_u32(available, "stock")?,
            }),
            None => Ok(StockChange::Missing),
        }
    }

    async fn increment_stock(&self, id: ProductId, quantity: u32) -> Result<Option<u32>> {
        let stock: Option<i32> = sqlx::query_scalar(
            "UPDATE products SET stock = stock + $2 WHERE id = $1 RETURNING stock",
        )
        .bind(id.as_uuid())
        .bind(to_i32(quantity)?)
        .fetch_optional(&self.pool)
        .await?;
        stock.map(|s| to_u32(s, "stock")).transpose()
    }

    async fn save_coupon(&self, coupon: &Coupon) -> Result<()> {
        let scope: Vec<Uuid> = coupon.product_scope.iter().map(|p| p.as_uuid()).collect();
        sqlx::query(
            r#"
            INSERT INTO coupons (id, merchant_id, code, discount, active, expires_at, product_scope)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE
            SET code = $3, discount = $4, active = $5, expires_at = $6, product_scope = $7
            "#,
        )
        .bind(coupon.id.as_uuid())
        .bind(coupon.merchant_id.as_uuid())
        .bind(&coupon.code)
        .bind(serde_json::to_value(coupon.discount)?)
        .bind(coupon.active)
        .bind(coupon.expires_at)
        .bind(scope)
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique_violation(e, || format!("coupon code {} exists", coupon.code)))?;
        Ok(())
    }

    async fn find_coupon(&self, merchant_id: MerchantId, code: &str) -> Result<Option<Coupon>> {
        let row = sqlx::query(
            r#"
            SELECT id, merchant_id, code, discount, active, expires_at, product_scope
            FROM coupons
            WHERE merchant_id = $1 AND code = $2
            "#,
        )
        .bind(merchant_id.as_uuid())
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_coupon).transpose()
    }

    async fn coupon_used_by(&self, coupon_id: CouponId, shopper_id: ShopperId) -> Result<bool> {
        let used: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM coupon_usages WHERE coupon_id = $1 AND shopper_id = $2)",
        )
        .bind(coupon_id.as_uuid())
        .bind(shopper_id.as_uuid())
        .fetch_one(&self.pool)
        .await?;
        Ok(used)
    }

    async fn record_coupon_usage(
        &self,
        coupon_id: CouponId,
        shopper_id: ShopperId,
        order_id: OrderId,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO coupon_usages (coupon_id, shopper_id, order_id)
            VALUES ($1, $2, $3)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(coupon_id.as_uuid())
        .bind(shopper_id.as_uuid())
        .bind(order_id.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl CartStore for PostgresStore {
    async fn insert_cart(&self, cart: &Cart) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO carts (id, shopper_id, merchant_id, status, total_amount, shipping_cost,
                               discount_amount, notes, timeout_days, stock_held, expires_at,
                               created_at, updated_at, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(cart.id.as_uuid())
        .bind(cart.shopper_id.as_uuid())
        .bind(cart.merchant_id.as_uuid())
        .bind(cart.status.as_str())
        .bind(cart.total_amount.amount())
        .bind(cart.shipping_cost.amount())
        .bind(cart.discount_amount.amount())
        .bind(&cart.notes)
        .bind(to_i32(cart.timeout_days)?)
        .bind(cart.stock_held)
        .bind(cart.expires_at)
        .bind(cart.created_at)
        .bind(cart.updated_at)
        .bind(cart.version)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            map_unique_violation(e, || {
                format!(
                    "shopper {} already has an active cart for merchant {}",
                    cart.shopper_id, cart.merchant_id
                )
            })
        })?;
        Ok(())
    }

    async fn save_cart(&self, cart: &mut Cart) -> Result<()> {
        let updated = update_cart(&self.pool, cart).await?;
        if updated == 0 {
            return Err(cart_conflict(cart));
        }
        cart.version += 1;
        Ok(())
    }

    async fn save_cart_with_items(
        &self,
        cart: &mut Cart,
        items: &[CartItem],
        removed: &[CartItemId],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        if update_cart(&mut *tx, cart).await? == 0 {
            return Err(cart_conflict(cart));
        }
        for item in items {
            upsert_item(&mut *tx, item).await?;
        }
        for id in removed {
            sqlx::query("DELETE FROM cart_items WHERE id = $1")
                .bind(id.as_uuid())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        cart.version += 1;
        Ok(())
    }

    async fn get_cart(&self, id: CartId) -> Result<Option<Cart>> {
        let row = sqlx::query(&format!("SELECT {CART_COLUMNS} FROM carts WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_cart).transpose()
    }

    async fn find_cart(
        &self,
        shopper_id: ShopperId,
        merchant_id: MerchantId,
        statuses: &[CartStatus],
    ) -> Result<Option<Cart>> {
        let statuses: Vec<&str> = statuses.iter().map(CartStatus::as_str).collect();
        let row = sqlx::query(&format!(
            r#"
            SELECT {CART_COLUMNS} FROM carts
            WHERE shopper_id = $1 AND merchant_id = $2 AND status = ANY($3)
            ORDER BY created_at DESC
            LIMIT 1
            "#
        ))
        .bind(shopper_id.as_uuid())
        .bind(merchant_id.as_uuid())
        .bind(statuses)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_cart).transpose()
    }

    async fn list_carts(&self, status: Option<CartStatus>) -> Result<Vec<Cart>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {CART_COLUMNS} FROM carts
            WHERE ($1::TEXT IS NULL OR status = $1)
            ORDER BY created_at DESC
            "#
        ))
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_cart).collect()
    }

    async fn expired_carts(&self, now: DateTime<Utc>) -> Result<Vec<Cart>> {
        self.fetch_carts(
            &format!(
                "SELECT {CART_COLUMNS} FROM carts \
                 WHERE status = 'ACTIVE' AND expires_at < $1 ORDER BY expires_at"
            ),
            &[now],
        )
        .await
    }

    async fn carts_expiring_between(
        &self,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Cart>> {
        self.fetch_carts(
            &format!(
                "SELECT {CART_COLUMNS} FROM carts \
                 WHERE status = 'ACTIVE' AND expires_at > $1 AND expires_at <= $2 \
                 ORDER BY expires_at"
            ),
            &[after, until],
        )
        .await
    }

    async fn get_item(&self, id: CartItemId) -> Result<Option<CartItem>> {
        let row = sqlx::query(
            r#"
            SELECT id, cart_id, product_id, variant_id, quantity, unit_price, subtotal, created_at
            FROM cart_items WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_item).transpose()
    }

    async fn cart_items(&self, cart_id: CartId) -> Result<Vec<CartItem>> {
        let rows = sqlx::query(
            r#"
            SELECT id, cart_id, product_id, variant_id, quantity, unit_price, subtotal, created_at
            FROM cart_items WHERE cart_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(cart_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_item).collect()
    }

    async fn save_item(&self, item: &CartItem) -> Result<()> {
        upsert_item(&self.pool, item).await
    }

    async fn delete_item(&self, id: CartItemId) -> Result<()> {
        sqlx::query("DELETE FROM cart_items WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl OrderStore for PostgresStore {
    async fn insert_order(&self, order: &Order) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO orders (id, merchant_id, shopper_id, status, subtotal, discount_amount,
                                shipping_cost, total_amount, coupon_code, cart_id, carrier,
                                payment_id, shipment_id, stock_reserved, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(order.id.as_uuid())
        .bind(order.merchant_id.as_uuid())
        .bind(order.shopper_id.as_uuid())
        .bind(order.status.as_str())
        .bind(order.totals.subtotal.amount())
        .bind(order.totals.discount.amount())
        .bind(order.totals.shipping.amount())
        .bind(order.totals.total.amount())
        .bind(&order.coupon_code)
        .bind(order.cart_id.map(|c| c.as_uuid()))
        .bind(&order.carrier)
        .bind(order.payment_id.map(|p| p.as_uuid()))
        .bind(order.shipment_id.map(|s| s.as_uuid()))
        .bind(order.stock_reserved)
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_unique_violation(e, || format!("order {} already exists", order.id)))?;

        for (position, line) in order.lines.iter().enumerate() {
            let position = i32::try_from(position)
                .map_err(|_| StoreError::Corrupt(format!("too many lines: {position}")))?;
            sqlx::query(
                r#"
                INSERT INTO order_lines (order_id, position, product_id, variant_id, quantity, unit_price)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(order.id.as_uuid())
            .bind(position)
            .bind(line.product_id.as_uuid())
            .bind(line.variant_id.map(|v| v.as_uuid()))
            .bind(to_i32(line.quantity)?)
            .bind(line.unit_price.amount())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn save_order(&self, order: &Order) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE orders
            SET status = $2, payment_id = $3, shipment_id = $4, stock_reserved = $5, updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(order.id.as_uuid())
        .bind(order.status.as_str())
        .bind(order.payment_id.map(|p| p.as_uuid()))
        .bind(order.shipment_id.map(|s| s.as_uuid()))
        .bind(order.stock_reserved)
        .bind(order.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_order_if_status(
        &self,
        order: &Order,
        expected: OrderStatus,
    ) -> Result<Option<bool>> {
        // The CTE locks the row and hands back the flag being replaced.
        let previous: Option<bool> = sqlx::query_scalar(
            r#"
            WITH prev AS (
                SELECT id, stock_reserved FROM orders
                WHERE id = $1 AND status = $7
                FOR UPDATE
            )
            UPDATE orders o
            SET status = $2, payment_id = $3, shipment_id = $4, stock_reserved = $5, updated_at = $6
            FROM prev
            WHERE o.id = prev.id AND o.status = $7
            RETURNING prev.stock_reserved
            "#,
        )
        .bind(order.id.as_uuid())
        .bind(order.status.as_str())
        .bind(order.payment_id.map(|p| p.as_uuid()))
        .bind(order.shipment_id.map(|s| s.as_uuid()))
        .bind(order.stock_reserved)
        .bind(order.updated_at)
        .bind(expected.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(previous)
    }

    async fn get_order(&self, id: OrderId) -> Result<Option<Order>> {
        let Some(row) = sqlx::query(
            r#"
            SELECT id, merchant_id, shopper_id, status, subtotal, discount_amount, shipping_cost,
                   total_amount, coupon_code, cart_id, carrier, payment_id, shipment_id,
                   stock_reserved, created_at, updated_at
            FROM orders WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let line_rows = sqlx::query(
            r#"
            SELECT product_id, variant_id, quantity, unit_price
            FROM order_lines WHERE order_id = $1
            ORDER BY position ASC
            "#,
        )
        .bind(id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        let lines = line_rows
            .iter()
            .map(|r| -> Result<OrderLine> {
                Ok(OrderLine {
                    product_id: ProductId::from_uuid(r.try_get("product_id")?),
                    variant_id: r
                        .try_get::<Option<Uuid>, _>("variant_id")?
                        .map(VariantId::from_uuid),
                    quantity: to_u32(r.try_get("quantity")?, "quantity")?,
                    unit_price: Money::new(r.try_get("unit_price")?),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let status: String = row.try_get("status")?;
        let status: OrderStatus = status.parse().map_err(StoreError::Corrupt)?;

        Ok(Some(Order {
            id: OrderId::from_uuid(row.try_get("id")?),
            merchant_id: MerchantId::from_uuid(row.try_get("merchant_id")?),
            shopper_id: ShopperId::from_uuid(row.try_get("shopper_id")?),
            status,
            totals: OrderTotals {
                subtotal: Money::new(row.try_get("subtotal")?),
                discount: Money::new(row.try_get("discount_amount")?),
                shipping: Money::new(row.try_get("shipping_cost")?),
                total: Money::new(row.try_get("total_amount")?),
            },
            coupon_code: row.try_get("coupon_code")?,
            cart_id: row
                .try_get::<Option<Uuid>, _>("cart_id")?
                .map(CartId::from_uuid),
            carrier: row.try_get("carrier")?,
            lines,
            payment_id: row
                .try_get::<Option<Uuid>, _>("payment_id")?
                .map(PaymentId::from_uuid),
            shipment_id: row
                .try_get::<Option<Uuid>, _>("shipment_id")?
                .map(ShipmentId::from_uuid),
            stock_reserved: row.try_get("stock_reserved")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        }))
    }

    async fn insert_payment(&self, payment: &Payment) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO payments (id, order_id, external_reference, receipt_number, amount, status,
                                  outcome, response, raw_response, split, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(payment.id.as_uuid())
        .bind(payment.order_id.as_uuid())
        .bind(&payment.external_reference)
        .bind(&payment.receipt_number)
        .bind(payment.amount.amount())
        .bind(&payment.status)
        .bind(payment.outcome.as_str())
        .bind(&payment.response)
        .bind(&payment.raw_response)
        .bind(payment.split.map(serde_json::to_value).transpose()?)
        .bind(payment.created_at)
        .bind(payment.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            map_unique_violation(e, || {
                format!(
                    "payment reference {} already exists",
                    payment.external_reference
                )
            })
        })?;
        Ok(())
    }

    async fn save_payment(&self, payment: &Payment) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE payments
            SET receipt_number = $2, status = $3, outcome = $4, response = $5,
                raw_response = $6, updated_at = $7
            WHERE id = $1
            "#,
        )
        .bind(payment.id.as_uuid())
        .bind(&payment.receipt_number)
        .bind(&payment.status)
        .bind(payment.outcome.as_str())
        .bind(&payment.response)
        .bind(&payment.raw_response)
        .bind(payment.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_payment(&self, id: PaymentId) -> Result<Option<Payment>> {
        let row = sqlx::query("SELECT * FROM payments WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_payment).transpose()
    }

    async fn find_payment_by_reference(&self, reference: &str) -> Result<Option<Payment>> {
        let row = sqlx::query("SELECT * FROM payments WHERE external_reference = $1")
            .bind(reference)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_payment).transpose()
    }

    async fn save_shipment(&self, shipment: &Shipment) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO shipments (id, order_id, carrier, tracking_number, label_url, status,
                                   message, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE
            SET tracking_number = $4, label_url = $5, status = $6, message = $7
            "#,
        )
        .bind(shipment.id.as_uuid())
        .bind(shipment.order_id.as_uuid())
        .bind(&shipment.carrier)
        .bind(&shipment.tracking_number)
        .bind(&shipment.label_url)
        .bind(&shipment.status)
        .bind(&shipment.message)
        .bind(shipment.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_shipment_if_status(&self, shipment: &Shipment, expected: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE shipments
            SET tracking_number = $2, label_url = $3, status = $4, message = $5
            WHERE id = $1 AND status = $6
            "#,
        )
        .bind(shipment.id.as_uuid())
        .bind(&shipment.tracking_number)
        .bind(&shipment.label_url)
        .bind(&shipment.status)
        .bind(&shipment.message)
        .bind(expected)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_shipment(&self, id: ShipmentId) -> Result<Option<Shipment>> {
        let row = sqlx::query("SELECT * FROM shipments WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_shipment).transpose()
    }

    async fn find_shipment_by_tracking(&self, tracking_number: &str) -> Result<Option<Shipment>> {
        let row = sqlx::query(
            "SELECT * FROM shipments WHERE tracking_number = $1 ORDER BY created_at DESC LIMIT 1",
        )
        .bind(tracking_number)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_shipment).transpose()
    }

    async fn shipments_to_track(&self, excluded: &[&str], limit: usize) -> Result<Vec<Shipment>> {
        let limit = i64::try_from(limit)
            .map_err(|_| StoreError::Corrupt(format!("limit out of range: {limit}")))?;
        let rows = sqlx::query(
            r#"
            SELECT * FROM shipments
            WHERE tracking_number IS NOT NULL AND NOT (status = ANY($1))
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(excluded)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_shipment).collect()
    }
}
