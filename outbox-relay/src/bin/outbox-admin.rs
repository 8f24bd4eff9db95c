use std::env;
use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use uuid::Uuid;

use outbox_relay::admin::AdminService;
use outbox_relay::store::postgres::PgEventStore;
use outbox_relay::store::{EventFilter, Page};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage:");
        eprintln!("  outbox-admin list <DATABASE_URL>");
        eprintln!("  outbox-admin list-pending <DATABASE_URL>");
        eprintln!("  outbox-admin dead-letters <limit> <DATABASE_URL>");
        eprintln!("  outbox-admin mark-unsent <event_uuid> <DATABASE_URL>");
        eprintln!("  outbox-admin requeue-dead-letter <event_uuid> <DATABASE_URL>");
        eprintln!("  outbox-admin archive <retention_days> <DATABASE_URL>");
        std::process::exit(1);
    }

    let cmd = args[1].as_str();

    match cmd {
        "list" if args.len() == 3 => {
            let admin = connect(&args[2]).await?;
            let events = admin
                .list_events(&EventFilter::default(), &Page::default())
                .await?;
            print_events(&events);
        }
        "list-pending" if args.len() == 3 => {
            let admin = connect(&args[2]).await?;
            let filter = EventFilter {
                pending_only: true,
                ..Default::default()
            };
            let events = admin.list_events(&filter, &Page::default()).await?;
            print_events(&events);
        }
        "dead-letters" if args.len() == 4 => {
            let limit: i64 = args[2].parse()?;
            let admin = connect(&args[3]).await?;
            for dl in admin.dead_letters(limit).await? {
                println!(
                    "{}  {}  failed_at={}  error={}",
                    dl.id, dl.event_type, dl.failed_at, dl.final_error
                );
            }
        }
        "mark-unsent" if args.len() == 4 => {
            let id = Uuid::parse_str(&args[2])?;
            let admin = connect(&args[3]).await?;
            admin.mark_unsent(id).await?;
            println!("Marked {} unsent", id);
        }
        "requeue-dead-letter" if args.len() == 4 => {
            let id = Uuid::parse_str(&args[2])?;
            let admin = connect(&args[3]).await?;
            admin.requeue_dead_letter(id).await?;
            println!("Requeued dead-lettered event {}", id);
        }
        "archive" if args.len() == 4 => {
            let retention_days: i64 = args[2].parse()?;
            let admin = connect(&args[3]).await?;
            let count = admin.run_archival(retention_days).await?;
            println!("Archived {} events older than {} days", count, retention_days);
        }
        _ => {
            eprintln!("Invalid arguments");
            std::process::exit(1);
        }
    }

    Ok(())
}

async fn connect(db_url: &str) -> Result<AdminService<PgEventStore>, Box<dyn std::error::Error>> {
    let pool = PgPool::connect(db_url).await?;
    let store = Arc::new(PgEventStore::new(pool, Duration::from_secs(30)));
    Ok(AdminService::new(store))
}

fn print_events(events: &[outbox_relay::event::OutboxEvent]) {
    for event in events {
        let status = if event.sent_at.is_some() {
            "sent"
        } else if event.in_progress_until.is_some() {
            "claimed"
        } else {
            "pending"
        };
        println!(
            "{}  {}  {}  created={}  status={}",
            event.id, event.event_type, event.aggregate_id, event.created_at, status
        );
    }
}
