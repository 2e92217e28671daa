mod cache;
mod helpers;
mod schedule;
mod simulate;
mod template;
mod today;

pub(crate) use cache::{cmd_cache_list, cmd_cache_prune};
pub(crate) use schedule::{cmd_schedule_assign, cmd_schedule_clear, cmd_schedule_show};
pub(crate) use simulate::cmd_simulate;
pub(crate) use template::{cmd_template_add_block, cmd_template_create, cmd_template_list};
pub(crate) use today::{cmd_history, cmd_today};
