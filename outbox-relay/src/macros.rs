//! Convenience macros for writing outbox events.

/// Write an event to the outbox within a transaction.
///
/// Shorthand for the common write-alongside-business-mutation pattern:
///
/// ```ignore
/// let mut tx = pool.begin().await?;
///
/// sqlx::query("INSERT INTO orders (id, total_cents) VALUES ($1, $2)")
///     .bind(order_id)
///     .bind(total_cents)
///     .execute(&mut *tx)
///     .await?;
///
/// write_event!(
///     &mut tx,
///     writer,
///     "order",
///     order_id,
///     "order.placed",
///     json!({ "order_id": order_id, "total_cents": total_cents })
/// )?;
///
/// tx.commit().await?;
/// ```
#[macro_export]
macro_rules! write_event {
    ($tx:expr, $writer:expr, $aggregate_type:expr, $aggregate_id:expr, $event_type:expr, $payload:expr) => {
        $writer
            .write($tx, $aggregate_type, $aggregate_id, $event_type, &$payload)
            .await
    };
}

/// Write an event with an explicit correlation id, for handlers that
/// propagate one from an inbound message.
#[macro_export]
macro_rules! write_event_with_correlation {
    (
        $tx:expr,
        $writer:expr,
        $aggregate_type:expr,
        $aggregate_id:expr,
        $event_type:expr,
        $payload:expr,
        $correlation_id:expr
    ) => {
        $writer
            .write_with_correlation(
                $tx,
                $aggregate_type,
                $aggregate_id,
                $event_type,
                &$payload,
                $correlation_id,
            )
            .await
    };
}
