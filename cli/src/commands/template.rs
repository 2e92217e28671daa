use anyhow::{Context, Result};
use serde::Serialize;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use stepsync_core::db::Database;
use stepsync_core::models::{NewTimeBlock, Template, TimeBlock};
use stepsync_core::progress::daily_target;

use super::helpers::{format_time, parse_time, truncate};

pub(super) fn resolve_template(db: &Database, name: &str) -> Result<Template> {
    db.get_template_by_name(name)?.with_context(|| {
        format!("Template '{name}' not found. Use `stepsync template create` first.")
    })
}

pub(crate) fn cmd_template_create(db: &Database, name: &str, json: bool) -> Result<()> {
    let template = db.create_template(name)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&template)?);
    } else {
        println!("Created template '{}' (id {})", template.name, template.id);
    }
    Ok(())
}

pub(crate) fn cmd_template_add_block(
    db: &Database,
    template: &str,
    name: &str,
    start: &str,
    end: &str,
    target: i64,
    json: bool,
) -> Result<()> {
    let template = resolve_template(db, template)?;
    let block = db.add_time_block(&NewTimeBlock {
        template_id: template.id,
        name: name.to_string(),
        start_time: parse_time(start)?,
        end_time: parse_time(end)?,
        target_steps: target,
    })?;

    if json {
        println!("{}", serde_json::to_string_pretty(&block)?);
    } else {
        println!(
            "Added '{}' {}-{} ({} steps) to '{}'",
            block.name,
            format_time(block.start_time),
            format_time(block.end_time),
            block.target_steps,
            template.name
        );
        if block.wraps_midnight() {
            eprintln!("Note: block runs past midnight");
        }
    }
    Ok(())
}

pub(crate) fn cmd_template_list(db: &Database, json: bool) -> Result<()> {
    #[derive(Serialize)]
    struct TemplateDetail {
        #[serde(flatten)]
        template: Template,
        daily_target: i64,
        blocks: Vec<TimeBlock>,
    }

    #[derive(Tabled)]
    struct BlockRow {
        #[tabled(rename = "Template")]
        template: String,
        #[tabled(rename = "Block")]
        name: String,
        #[tabled(rename = "Start")]
        start: String,
        #[tabled(rename = "End")]
        end: String,
        #[tabled(rename = "Target")]
        target: i64,
    }

    let mut details = Vec::new();
    for template in db.list_templates()? {
        let blocks = db.get_time_blocks(template.id)?;
        details.push(TemplateDetail {
            daily_target: daily_target(&blocks),
            template,
            blocks,
        });
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&details)?);
        return Ok(());
    }

    if details.is_empty() {
        eprintln!("No templates yet. Use `stepsync template create <name>` to add one.");
        return Ok(());
    }

    let mut rows = Vec::new();
    for detail in &details {
        if detail.blocks.is_empty() {
            rows.push(BlockRow {
                template: truncate(&detail.template.name, 25),
                name: "-".to_string(),
                start: String::new(),
                end: String::new(),
                target: 0,
            });
        }
        for block in &detail.blocks {
            rows.push(BlockRow {
                template: truncate(&detail.template.name, 25),
                name: truncate(&block.name, 30),
                start: format_time(block.start_time),
                end: format_time(block.end_time),
                target: block.target_steps,
            });
        }
    }

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(4..)).with(Alignment::right()))
        .to_string();
    println!("{table}");
    for detail in &details {
        println!(
            "  {}: {} steps/day",
            detail.template.name, detail.daily_target
        );
    }

    Ok(())
}
