//! Order settlement: order creation, charge initiation and payment confirmation.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{CartId, MerchantId, OrderId, PaymentId, ProductId, ShopperId};
use domain::{
    Cart, CartItem, CartStatus, ChargeOutcome, Coupon, CouponError, Merchant, Money, Order, OrderLine,
    OrderStatus, OrderTotals, Payment, Shipment, Shopper, SplitAllocation, SplitPolicy,
    order::validate_lines,
};
use queue::{Publisher, Topic};
use serde::Serialize;
use store::Store;
use tokio::task::JoinHandle;

use crate::cart::CartManager;
use crate::error::{CheckoutError, Result};
use crate::ledger::{InventoryLedger, StockLine};
use crate::notifications::{self, ShipmentStatusPayload, ShippingInfo, ShopperContact};
use crate::retry::retry_transient;
use crate::services::{
    ChargeError, ChargeGateway, ChargeReceipt, ChargeRequest, InvoiceReceipt, InvoiceError,
    InvoiceRequest, InvoiceService, LabelError, LabelReceipt, LabelRequest, LabelService,
    DEFAULT_CARRIER,
};

/// Settings for [`SettlementService`].
#[derive(Debug, Clone)]
pub struct SettlementSettings {
    /// Orders totalling less than this are refused.
    pub minimum_charge: Money,
    pub currency: String,
    pub split: SplitPolicy,
    /// Bound on one charge attempt.
    pub charge_timeout: Duration,
    /// Attempts for transient gateway failures, the first one included.
    pub charge_attempts: u32,
}

impl Default for SettlementSettings {
    fn default() -> Self {
        Self {
            minimum_charge: Money::new(300),
            currency: "COP".to_string(),
            split: SplitPolicy::default(),
            charge_timeout: Duration::from_secs(60),
            charge_attempts: 3,
        }
    }
}

/// Input of [`SettlementService::create_order`].
#[derive(Debug, Clone)]
pub struct CreateOrder {
    pub shopper_id: ShopperId,
    pub merchant_id: MerchantId,
    pub lines: Vec<OrderLine>,
    pub shipping_cost: Money,
    pub coupon_code: Option<String>,
    /// Cart the order was checked out from, if any.
    pub originating_cart: Option<CartId>,
    pub bank_code: String,
    pub carrier: Option<String>,
}

/// Result of a successful order creation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderReceipt {
    pub order_id: OrderId,
    pub payment_id: PaymentId,
    pub total: Money,
    pub redirect_url: String,
    pub external_reference: String,
    pub split: Option<SplitAllocation>,
}

/// A status callback from the payment gateway.
#[derive(Debug, Clone)]
pub struct ChargeConfirmation {
    pub external_reference: String,
    pub status: String,
    pub response: Option<String>,
    pub raw: serde_json::Value,
}

/// How one post-acceptance step went.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum StepOutcome {
    Completed(String),
    /// Done in a reduced form that needs follow-up.
    Degraded(String),
    Skipped(String),
    Failed(String),
}

impl StepOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, StepOutcome::Failed(_))
    }
}

/// Results of the steps that follow a payment acceptance.
///
/// None of these steps can undo the acceptance; failures are reported here
/// instead of being raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SideEffectReport {
    pub cart: StepOutcome,
    pub shipment: StepOutcome,
    pub invoice: StepOutcome,
    pub notification: StepOutcome,
}

/// Result of applying a gateway confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ConfirmationOutcome {
    /// No payment carries the reference.
    PaymentNotFound,
    /// The order was settled by an earlier confirmation; nothing was repeated.
    AlreadySettled {
        order_id: OrderId,
        status: OrderStatus,
    },
    Pending {
        order_id: OrderId,
    },
    Accepted {
        order_id: OrderId,
        report: SideEffectReport,
    },
    Rejected {
        order_id: OrderId,
        restored_units: u32,
    },
}

/// Turns order requests into charged orders and applies gateway confirmations.
pub struct SettlementService<S, G, L, I>
where
    S: Store,
    G: ChargeGateway,
    L: LabelService,
    I: InvoiceService,
{
    store: S,
    ledger: InventoryLedger<S>,
    carts: CartManager<S>,
    gateway: Arc<G>,
    labels: Arc<L>,
    invoices: Arc<I>,
    publisher: Arc<dyn Publisher>,
    settings: SettlementSettings,
}

impl<S, G, L, I> SettlementService<S, G, L, I>
where
    S: Store,
    G: ChargeGateway + 'static,
    L: LabelService + 'static,
    I: InvoiceService + 'static,
{
    /// Creates a new settlement service.
    pub fn new(
        store: S,
        carts: CartManager<S>,
        gateway: Arc<G>,
        labels: Arc<L>,
        invoices: Arc<I>,
        publisher: Arc<dyn Publisher>,
        settings: SettlementSettings,
    ) -> Self {
        let ledger = carts.ledger().clone();
        Self {
            store,
            ledger,
            carts,
            gateway,
            labels,
            invoices,
            publisher,
            settings,
        }
    }

    /// Gets the settings.
    pub fn settings(&self) -> &SettlementSettings {
        &self.settings
    }

    /// Creates an order, reserves its stock and opens the charge.
    ///
    /// With an originating cart, units the cart already holds move to the
    /// order instead of being released and reserved again. When the charge
    /// cannot be opened or recorded the order is left REJECTED and the cart
    /// gets its hold back.
    #[tracing::instrument(skip(self, request), fields(merchant_id = %request.merchant_id, shopper_id = %request.shopper_id))]
    pub async fn create_order(&self, request: CreateOrder) -> Result<OrderReceipt> {
        let started = std::time::Instant::now();
        let now = Utc::now();

        // 1. Merchant and shopper must exist
        let merchant = self.merchant(request.merchant_id).await?;
        let shopper = self.shopper(request.shopper_id).await?;

        // 2. Validate lines
        validate_lines(&request.lines)?;
        let subtotal: Money = request.lines.iter().map(OrderLine::subtotal).sum();

        // 3-4. Coupon and discount
        let coupon = match &request.coupon_code {
            Some(code) => Some(self.check_coupon(&merchant, &shopper, code, &request.lines).await?),
            None => None,
        };
        let discount = coupon
            .as_ref()
            .map_or(Money::zero(), |c| c.discount_for(subtotal));

        // 5. Totals and minimum charge
        let totals = OrderTotals::compute(&request.lines, discount, request.shipping_cost);
        if totals.total < self.settings.minimum_charge {
            return Err(CheckoutError::BelowMinimumChargeAmount {
                total: totals.total,
                minimum: self.settings.minimum_charge,
            });
        }

        // 6. The originating cart must be the shopper's own open cart
        let cart = match request.originating_cart {
            Some(cart_id) => Some(
                self.carts
                    .cart_for_order(cart_id, shopper.id, merchant.id)
                    .await?,
            ),
            None => None,
        };

        // 7. Reserve what the cart's hold does not cover, then take the hold over
        let needed: Vec<StockLine> = request.lines.iter().map(StockLine::from).collect();
        let held = match &cart {
            Some(view) if view.cart.stock_held => stock_lines(&view.items),
            _ => Vec::new(),
        };
        let (extra, surplus) = split_hold(&needed, &held);
        self.ledger.reserve_all(&extra).await?;
        let transfer = match cart {
            Some(view) if view.cart.stock_held => {
                let mut cart = view.cart;
                if let Err(err) = self.carts.detach_hold(&mut cart).await {
                    self.ledger.release_all(&extra).await?;
                    return Err(err);
                }
                Some(HoldTransfer { cart, surplus })
            }
            _ => None,
        };
        let reservation = Reservation {
            needed,
            extra,
            transfer,
        };

        // 8. Persist the order
        let mut order = Order::new(
            merchant.id,
            shopper.id,
            request.lines,
            totals,
            now,
        );
        order.coupon_code = coupon.as_ref().map(|c| c.code.clone());
        order.cart_id = request.originating_cart;
        order.carrier = request.carrier;
        if let Err(err) = self.store.insert_order(&order).await {
            self.unwind_reservation(reservation, true).await?;
            return Err(err.into());
        }

        // 9. Split allocation
        let split = self.settings.split.allocate(&totals);

        // 10. Open the charge
        let charge = ChargeRequest {
            order_id: order.id,
            merchant_id: merchant.id,
            amount: totals.total,
            currency: self.settings.currency.clone(),
            bank_code: request.bank_code,
            description: format!("Order {} at {}", order.id, merchant.name),
            payer_name: shopper.name.clone(),
            payer_email: shopper.email.clone(),
            payer_phone: shopper.phone.clone(),
            split,
        };
        let receipt = match self.initiate_charge(charge).await {
            Ok(receipt) => receipt,
            Err(err) => {
                tracing::warn!(order_id = %order.id, error = %err, "charge failed, rejecting order");
                metrics::counter!("orders_rejected_total", "reason" => "charge_failed")
                    .increment(1);
                self.abandon_order(&mut order, reservation).await?;
                return Err(err.into());
            }
        };

        // 11. Pending payment; the order waits for confirmation
        let payment = Payment::pending(
            order.id,
            receipt.external_reference.clone(),
            receipt.receipt_number.clone(),
            totals.total,
            split,
            receipt.raw.clone(),
            Utc::now(),
        );
        order.payment_id = Some(payment.id);
        order.transition_to(OrderStatus::ChargePending, Utc::now())?;
        let recorded = match self.store.insert_payment(&payment).await {
            Ok(()) => {
                self.store
                    .save_order_if_status(&order, OrderStatus::Created)
                    .await
            }
            Err(err) => Err(err),
        };
        match recorded {
            Ok(Some(_)) => {}
            Ok(None) => {
                // Rolled back while the charge was being opened.
                let status = self.get_order(order.id).await?.status;
                tracing::error!(
                    order_id = %order.id,
                    external_reference = %receipt.external_reference,
                    %status,
                    "charge opened for an order closed meanwhile"
                );
                metrics::counter!("orders_rejected_total", "reason" => "closed_during_charge")
                    .increment(1);
                self.unwind_reservation(reservation, false).await?;
                return Err(CheckoutError::OrderClosed {
                    order_id: order.id,
                    status,
                });
            }
            Err(err) => {
                tracing::error!(
                    order_id = %order.id,
                    external_reference = %receipt.external_reference,
                    error = %err,
                    "charge opened but not recorded, rejecting order"
                );
                metrics::counter!("orders_rejected_total", "reason" => "payment_not_recorded")
                    .increment(1);
                order.payment_id = None;
                order.status = OrderStatus::Created;
                self.abandon_order(&mut order, reservation).await?;
                return Err(err.into());
            }
        }

        // 12. Held units the order did not need go back to stock
        if let Some(transfer) = &reservation.transfer
            && let Err(err) = self.ledger.release_all(&transfer.surplus).await
        {
            tracing::error!(order_id = %order.id, error = %err, "failed to release unused cart hold");
        }

        // 13. Coupon usage
        if let Some(coupon) = &coupon
            && let Err(err) = self
                .store
                .record_coupon_usage(coupon.id, shopper.id, order.id)
                .await
        {
            tracing::warn!(order_id = %order.id, coupon = %coupon.code, error = %err, "failed to record coupon usage");
        }

        metrics::counter!("orders_created_total").increment(1);
        metrics::histogram!("order_creation_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        tracing::info!(order_id = %order.id, total = %totals.total, "order created, charge pending");

        // 14. Receipt
        Ok(OrderReceipt {
            order_id: order.id,
            payment_id: payment.id,
            total: totals.total,
            redirect_url: receipt.redirect_url,
            external_reference: receipt.external_reference,
            split,
        })
    }

    /// Applies a gateway confirmation to the payment and its order.
    ///
    /// Confirmations are idempotent: the order only settles through a write
    /// guarded on its CHARGE_PENDING status, so of two racing confirmations
    /// exactly one settles it and releases stock. The other one, like any
    /// later confirmation, only refreshes the payment's gateway fields.
    #[tracing::instrument(skip(self, confirmation), fields(reference = %confirmation.external_reference))]
    pub async fn confirm_payment(
        &self,
        confirmation: ChargeConfirmation,
    ) -> Result<ConfirmationOutcome> {
        let Some(mut payment) = self
            .store
            .find_payment_by_reference(&confirmation.external_reference)
            .await?
        else {
            tracing::warn!("confirmation for an unknown payment reference");
            return Ok(ConfirmationOutcome::PaymentNotFound);
        };
        let mut order = self
            .store
            .get_order(payment.order_id)
            .await?
            .ok_or(CheckoutError::OrderNotFound(payment.order_id))?;

        let outcome = self
            .gateway
            .normalize_status(&confirmation.status, confirmation.response.as_deref());
        payment.status = confirmation.status;
        payment.response = confirmation.response;
        payment.raw_response = confirmation.raw;
        payment.updated_at = Utc::now();
        if !order.status.is_settled() && outcome == ChargeOutcome::Pending {
            payment.outcome = outcome;
        }
        self.store.save_payment(&payment).await?;

        if order.status.is_settled() {
            tracing::info!(order_id = %order.id, status = %order.status, "duplicate confirmation ignored");
            return Ok(ConfirmationOutcome::AlreadySettled {
                order_id: order.id,
                status: order.status,
            });
        }

        metrics::counter!("payment_confirmations_total", "outcome" => outcome.as_str())
            .increment(1);

        let expected = order.status;
        match outcome {
            ChargeOutcome::Pending => {
                tracing::info!(order_id = %order.id, "charge still pending");
                Ok(ConfirmationOutcome::Pending { order_id: order.id })
            }
            ChargeOutcome::Accepted => {
                order.transition_to(OrderStatus::Accepted, Utc::now())?;
                // The reservation is now a sale.
                order.stock_reserved = false;
                if self
                    .store
                    .save_order_if_status(&order, expected)
                    .await?
                    .is_none()
                {
                    return self.settled_elsewhere(order.id).await;
                }
                self.record_outcome(&mut payment, outcome).await?;
                tracing::info!(order_id = %order.id, "payment accepted");

                let report = self.run_side_effects(&mut order, &payment).await;
                Ok(ConfirmationOutcome::Accepted {
                    order_id: order.id,
                    report,
                })
            }
            ChargeOutcome::Rejected => {
                let lines = order_stock(&order);
                order.transition_to(OrderStatus::Rejected, Utc::now())?;
                order.stock_reserved = false;
                let restored_units = match self.store.save_order_if_status(&order, expected).await? {
                    None => return self.settled_elsewhere(order.id).await,
                    Some(true) => self.ledger.release_all(&lines).await?,
                    Some(false) => 0,
                };
                self.record_outcome(&mut payment, outcome).await?;
                tracing::info!(order_id = %order.id, restored_units, "payment rejected");

                let shopper = self.store.get_shopper(order.shopper_id).await?;
                self.publish_settlement(&order, &payment, shopper.as_ref(), None)
                    .await;
                Ok(ConfirmationOutcome::Rejected {
                    order_id: order.id,
                    restored_units,
                })
            }
        }
    }

    /// Returns an order's reserved units to stock, once.
    ///
    /// An order still waiting for its charge is REJECTED along the way, so a
    /// later acceptance finds it settled and cannot sell the released units.
    #[tracing::instrument(skip(self))]
    pub async fn rollback_stock(&self, order_id: OrderId) -> Result<u32> {
        let mut order = self.get_order(order_id).await?;
        if !order.stock_reserved {
            return Ok(0);
        }
        let expected = order.status;
        let lines = order_stock(&order);
        let now = Utc::now();
        if !order.status.is_settled() {
            order.transition_to(OrderStatus::Rejected, now)?;
        }
        order.stock_reserved = false;
        order.updated_at = now;

        let restored = match self.store.save_order_if_status(&order, expected).await? {
            Some(true) => self.ledger.release_all(&lines).await?,
            _ => 0,
        };
        if restored > 0 {
            metrics::counter!("orders_rejected_total", "reason" => "rolled_back").increment(1);
            tracing::info!(%order_id, restored, status = %order.status, "order stock rolled back");
        }
        Ok(restored)
    }

    /// Publishes the settlement notification of a payment again.
    ///
    /// Sends the order's current status and shipment, if any; nothing is
    /// changed.
    #[tracing::instrument(skip(self))]
    pub async fn resend_notification(&self, payment_reference: &str) -> Result<StepOutcome> {
        let payment = self
            .store
            .find_payment_by_reference(payment_reference)
            .await?
            .ok_or_else(|| CheckoutError::PaymentNotFound(payment_reference.to_string()))?;
        let order = self.get_order(payment.order_id).await?;
        let shopper = self.store.get_shopper(order.shopper_id).await?;
        let shipment = match order.shipment_id {
            Some(shipment_id) => self.store.get_shipment(shipment_id).await?,
            None => None,
        };

        let outcome = self
            .publish_settlement(&order, &payment, shopper.as_ref(), shipment.as_ref())
            .await;
        tracing::info!(order_id = %order.id, ?outcome, "settlement notification re-sent");
        Ok(outcome)
    }

    /// Creates an order from the lines of an EXPIRED cart.
    #[tracing::instrument(skip(self, bank_code))]
    pub async fn create_order_from_expired_cart(
        &self,
        cart_id: CartId,
        bank_code: String,
    ) -> Result<OrderReceipt> {
        let view = self.carts.get_cart(cart_id).await?;
        if view.cart.status != CartStatus::Expired {
            return Err(CheckoutError::CartNotExpired {
                cart_id,
                status: view.cart.status,
            });
        }

        let lines = view
            .items
            .iter()
            .map(|item| OrderLine {
                product_id: item.product_id,
                variant_id: item.variant_id,
                quantity: item.quantity,
                unit_price: item.unit_price,
            })
            .collect();

        self.create_order(CreateOrder {
            shopper_id: view.cart.shopper_id,
            merchant_id: view.cart.merchant_id,
            lines,
            shipping_cost: view.cart.shipping_cost,
            coupon_code: None,
            originating_cart: Some(cart_id),
            bank_code,
            carrier: None,
        })
        .await
    }

    /// Returns an order with its lines.
    pub async fn get_order(&self, order_id: OrderId) -> Result<Order> {
        self.store
            .get_order(order_id)
            .await?
            .ok_or(CheckoutError::OrderNotFound(order_id))
    }

    async fn initiate_charge(
        &self,
        request: ChargeRequest,
    ) -> std::result::Result<ChargeReceipt, ChargeError> {
        let timeout = self.settings.charge_timeout;
        retry_transient(self.settings.charge_attempts, |attempt| {
            let gateway = self.gateway.clone();
            let request = request.clone();
            async move {
                tracing::debug!(attempt, order_id = %request.order_id, "initiating charge");
                match tokio::time::timeout(timeout, gateway.initiate_charge(request)).await {
                    Ok(result) => result,
                    Err(_) => Err(ChargeError::Unavailable(format!(
                        "no answer within {}s",
                        timeout.as_secs()
                    ))),
                }
            }
        })
        .await
    }

    /// Rejects a CREATED order that never got its charge recorded.
    async fn abandon_order(&self, order: &mut Order, reservation: Reservation) -> Result<()> {
        order.transition_to(OrderStatus::Rejected, Utc::now())?;
        order.stock_reserved = false;
        let owned = self
            .store
            .save_order_if_status(order, OrderStatus::Created)
            .await?;
        self.unwind_reservation(reservation, owned == Some(true))
            .await
    }

    /// Gives back what an aborted order creation holds.
    ///
    /// `owns_order_units` is false when someone else already released the
    /// order's lines; only the cart surplus is left to return then.
    async fn unwind_reservation(&self, reservation: Reservation, owns_order_units: bool) -> Result<()> {
        let Reservation {
            needed,
            extra,
            transfer,
        } = reservation;
        let Some(mut transfer) = transfer else {
            if owns_order_units {
                self.ledger.release_all(&needed).await?;
            }
            return Ok(());
        };
        if !owns_order_units {
            self.ledger.release_all(&transfer.surplus).await?;
            return Ok(());
        }
        match self.carts.reattach_hold(&mut transfer.cart).await {
            Ok(()) => {
                self.ledger.release_all(&extra).await?;
            }
            Err(err) => {
                tracing::warn!(cart_id = %transfer.cart.id, error = %err, "cart changed meanwhile, releasing its former hold");
                self.ledger.release_all(&needed).await?;
                self.ledger.release_all(&transfer.surplus).await?;
            }
        }
        Ok(())
    }

    async fn record_outcome(&self, payment: &mut Payment, outcome: ChargeOutcome) -> Result<()> {
        payment.outcome = outcome;
        self.store.save_payment(payment).await?;
        Ok(())
    }

    async fn settled_elsewhere(&self, order_id: OrderId) -> Result<ConfirmationOutcome> {
        let order = self.get_order(order_id).await?;
        tracing::info!(%order_id, status = %order.status, "order settled by a concurrent confirmation");
        Ok(ConfirmationOutcome::AlreadySettled {
            order_id,
            status: order.status,
        })
    }

    async fn run_side_effects(&self, order: &mut Order, payment: &Payment) -> SideEffectReport {
        let merchant = self.store.get_merchant(order.merchant_id).await.ok().flatten();
        let shopper = self.store.get_shopper(order.shopper_id).await.ok().flatten();

        let cart = match order.cart_id {
            Some(cart_id) => match self.carts.complete(cart_id).await {
                Ok(_) => StepOutcome::Completed(format!("cart {cart_id} completed")),
                Err(err) => {
                    tracing::warn!(%cart_id, error = %err, "failed to complete cart");
                    StepOutcome::Failed(err.to_string())
                }
            },
            None => StepOutcome::Skipped("order has no originating cart".to_string()),
        };

        let (Some(merchant), Some(shopper)) = (merchant, shopper) else {
            let missing = "merchant or shopper no longer exists".to_string();
            return SideEffectReport {
                cart,
                shipment: StepOutcome::Failed(missing.clone()),
                invoice: StepOutcome::Failed(missing.clone()),
                notification: StepOutcome::Failed(missing),
            };
        };

        // Label and invoice run concurrently as supervised tasks.
        let label_task = (!merchant.config.free_shipping).then(|| self.spawn_label(order, &shopper));
        let invoice_task = merchant
            .config
            .invoicing_enabled
            .then(|| self.spawn_invoice(order, &shopper));

        let (shipment_outcome, shipment) = match label_task {
            None => {
                let shipment = Shipment::local(order.id, Utc::now());
                let detail = "merchant handles delivery".to_string();
                (StepOutcome::Completed(detail), shipment)
            }
            Some(task) => self.label_outcome(order, task).await,
        };
        let shipment_outcome = match self.store.save_shipment(&shipment).await {
            Ok(()) => {
                order.shipment_id = Some(shipment.id);
                match self.store.save_order(order).await {
                    Ok(()) => shipment_outcome,
                    Err(err) => StepOutcome::Failed(format!("shipment not linked: {err}")),
                }
            }
            Err(err) => StepOutcome::Failed(format!("shipment not stored: {err}")),
        };

        let invoice = match invoice_task {
            None => StepOutcome::Skipped("invoicing disabled for merchant".to_string()),
            Some(task) => invoice_outcome(order.id, task.await),
        };

        let notification = self
            .publish_settlement(order, payment, Some(&shopper), Some(&shipment))
            .await;

        let report = SideEffectReport {
            cart,
            shipment: shipment_outcome,
            invoice,
            notification,
        };
        for (step, outcome) in [
            ("cart", &report.cart),
            ("shipment", &report.shipment),
            ("invoice", &report.invoice),
            ("notification", &report.notification),
        ] {
            if outcome.is_failed() {
                metrics::counter!("settlement_side_effect_failures_total", "step" => step)
                    .increment(1);
            }
        }
        report
    }

    fn spawn_label(
        &self,
        order: &Order,
        shopper: &Shopper,
    ) -> JoinHandle<std::result::Result<LabelReceipt, LabelError>> {
        let labels = self.labels.clone();
        let request = LabelRequest {
            order_id: order.id,
            carrier: order.carrier.clone(),
            recipient_name: shopper.name.clone(),
            recipient_phone: shopper.phone.clone(),
            address: shopper.address.clone(),
            city: shopper.city.clone(),
            units: order.unit_count(),
            declared_value: order.totals.product_value(),
        };
        tokio::spawn(async move { labels.create_label(request).await })
    }

    fn spawn_invoice(
        &self,
        order: &Order,
        shopper: &Shopper,
    ) -> JoinHandle<std::result::Result<InvoiceReceipt, InvoiceError>> {
        let invoices = self.invoices.clone();
        let request = InvoiceRequest {
            order_id: order.id,
            merchant_id: order.merchant_id,
            customer_name: shopper.name.clone(),
            customer_email: shopper.email.clone(),
            lines: order.lines.clone(),
            shipping: order.totals.shipping,
            discount: order.totals.discount,
            total: order.totals.total,
        };
        tokio::spawn(async move { invoices.issue_invoice(request).await })
    }

    async fn label_outcome(
        &self,
        order: &Order,
        task: JoinHandle<std::result::Result<LabelReceipt, LabelError>>,
    ) -> (StepOutcome, Shipment) {
        let carrier = order.carrier.as_deref().unwrap_or(DEFAULT_CARRIER);
        match task.await {
            Ok(Ok(receipt)) => {
                let detail = format!("label {} issued", receipt.tracking_number);
                let shipment = Shipment::labeled(
                    order.id,
                    receipt.carrier,
                    receipt.tracking_number,
                    receipt.label_url,
                    receipt.status,
                    Utc::now(),
                );
                (StepOutcome::Completed(detail), shipment)
            }
            Ok(Err(err)) => {
                tracing::warn!(order_id = %order.id, error = %err, "label failed, shipment left pending");
                let shipment = Shipment::label_pending(order.id, carrier, err.to_string(), Utc::now());
                (StepOutcome::Degraded(err.to_string()), shipment)
            }
            Err(err) => {
                tracing::error!(order_id = %order.id, error = %err, "label task crashed");
                let shipment = Shipment::label_pending(order.id, carrier, err.to_string(), Utc::now());
                (StepOutcome::Failed(format!("label task crashed: {err}")), shipment)
            }
        }
    }

    async fn publish_settlement(
        &self,
        order: &Order,
        payment: &Payment,
        shopper: Option<&Shopper>,
        shipment: Option<&Shipment>,
    ) -> StepOutcome {
        let Some(shopper) = shopper else {
            return StepOutcome::Failed("shopper no longer exists".to_string());
        };
        let payload = ShipmentStatusPayload {
            payment_reference: payment.external_reference.clone(),
            receipt_number: payment.receipt_number.clone(),
            order_id: order.id,
            shopper: ShopperContact::from(shopper),
            amount: payment.amount,
            status: order.status.to_string(),
            previous_status: None,
            shipping: shipment.map(|s| ShippingInfo::new(s, shopper)),
        };
        if notifications::publish(
            self.publisher.as_ref(),
            Topic::shipment_status_changed(),
            &payload,
        )
        .await
        {
            StepOutcome::Completed("notification queued".to_string())
        } else {
            StepOutcome::Failed("notification was not queued".to_string())
        }
    }

    async fn check_coupon(
        &self,
        merchant: &Merchant,
        shopper: &Shopper,
        code: &str,
        lines: &[OrderLine],
    ) -> Result<Coupon> {
        let coupon = self
            .store
            .find_coupon(merchant.id, code)
            .await?
            .ok_or_else(|| CouponError::Invalid(code.to_string()))?;
        let used = self.store.coupon_used_by(coupon.id, shopper.id).await?;
        let products: Vec<ProductId> = lines.iter().map(|l| l.product_id).collect();
        coupon.check(merchant.id, used, &products, Utc::now())?;
        Ok(coupon)
    }

    async fn merchant(&self, id: MerchantId) -> Result<Merchant> {
        self.store
            .get_merchant(id)
            .await?
            .ok_or(CheckoutError::MerchantNotFound(id))
    }

    async fn shopper(&self, id: ShopperId) -> Result<Shopper> {
        self.store
            .get_shopper(id)
            .await?
            .ok_or(CheckoutError::ShopperNotFound(id))
    }
}

fn invoice_outcome(
    order_id: OrderId,
    joined: std::result::Result<std::result::Result<InvoiceReceipt, InvoiceError>, tokio::task::JoinError>,
) -> StepOutcome {
    match joined {
        Ok(Ok(receipt)) => StepOutcome::Completed(format!("invoice {} issued", receipt.invoice_number)),
        Ok(Err(err)) => {
            tracing::warn!(%order_id, error = %err, "invoice failed");
            StepOutcome::Failed(err.to_string())
        }
        Err(err) => {
            tracing::error!(%order_id, error = %err, "invoice task crashed");
            StepOutcome::Failed(format!("invoice task crashed: {err}"))
        }
    }
}

/// Stock an order creation holds until its charge is recorded.
struct Reservation {
    /// The order's lines.
    needed: Vec<StockLine>,
    /// Units reserved on top of the cart's hold.
    extra: Vec<StockLine>,
    transfer: Option<HoldTransfer>,
}

/// A cart hold taken over by an order.
struct HoldTransfer {
    cart: Cart,
    /// Held units the order does not use.
    surplus: Vec<StockLine>,
}

fn order_stock(order: &Order) -> Vec<StockLine> {
    order.lines.iter().map(StockLine::from).collect()
}

fn stock_lines(items: &[CartItem]) -> Vec<StockLine> {
    items.iter().map(StockLine::from).collect()
}

fn totals_by_product(lines: &[StockLine]) -> BTreeMap<ProductId, u32> {
    let mut totals = BTreeMap::new();
    for line in lines {
        *totals.entry(line.product_id).or_insert(0) += line.quantity;
    }
    totals
}

/// Splits `needed` against `held`: units still to reserve, and held units
/// left over.
fn split_hold(needed: &[StockLine], held: &[StockLine]) -> (Vec<StockLine>, Vec<StockLine>) {
    let needed = totals_by_product(needed);
    let held = totals_by_product(held);
    let remainder = |from: &BTreeMap<ProductId, u32>, against: &BTreeMap<ProductId, u32>| {
        from.iter()
            .filter_map(|(&product_id, &quantity)| {
                let covered = against.get(&product_id).copied().unwrap_or(0);
                (quantity > covered).then(|| StockLine::new(product_id, quantity - covered))
            })
            .collect::<Vec<_>>()
    };
    (remainder(&needed, &held), remainder(&held, &needed))
}
