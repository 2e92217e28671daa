use anyhow::Result;
use tabled::{Table, Tabled, settings::Style};

use stepsync_core::db::Database;

use super::helpers::{day_name, parse_days};
use super::template::resolve_template;

pub(crate) fn cmd_schedule_assign(db: &Database, template: &str, day: &str, json: bool) -> Result<()> {
    let template = resolve_template(db, template)?;
    let days = parse_days(day)?;

    let mut bindings = Vec::new();
    for &d in &days {
        bindings.push(db.assign_day(d, template.id)?);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&bindings)?);
    } else {
        for binding in &bindings {
            println!("{}: {}", day_name(binding.day_of_week), template.name);
        }
    }
    Ok(())
}

pub(crate) fn cmd_schedule_show(db: &Database, json: bool) -> Result<()> {
    #[derive(Tabled)]
    struct ScheduleRow {
        #[tabled(rename = "Day")]
        day: &'static str,
        #[tabled(rename = "Template")]
        template: String,
    }

    let bindings = db.get_all_day_assignments()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&bindings)?);
        return Ok(());
    }

    if bindings.is_empty() {
        eprintln!("No days scheduled. Use `stepsync schedule assign <template> --day <day>`.");
        return Ok(());
    }

    let rows: Vec<ScheduleRow> = (0..7)
        .map(|d| ScheduleRow {
            day: day_name(d),
            template: bindings
                .iter()
                .find(|b| b.day_of_week == d)
                .and_then(|b| b.template_name.clone())
                .unwrap_or_else(|| "-".to_string()),
        })
        .collect();

    let table = Table::new(&rows).with(Style::rounded()).to_string();
    println!("{table}");
    Ok(())
}

pub(crate) fn cmd_schedule_clear(db: &Database, day: Option<&str>, json: bool) -> Result<()> {
    let days = parse_days(day.unwrap_or("all"))?;
    let mut cleared = false;
    for &d in &days {
        if db.clear_day_assignment(d)? {
            cleared = true;
        }
    }

    if json {
        println!("{}", serde_json::json!({ "cleared": cleared }));
    } else if cleared {
        println!("Schedule cleared");
    } else {
        eprintln!("No schedule was set");
    }
    Ok(())
}
