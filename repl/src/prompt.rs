use super::display::DisplayConfig;
use colored::Colorize;
use tandem_core::GroupId;

pub fn generate_prompt(group: Option<GroupId>, command_count: usize, config: &DisplayConfig) -> String {
    let base = "tandem";
    let group = group.map(|g| format!(" g{}", g)).unwrap_or_default();

    if config.use_colors {
        format!(
            "{}{}{}> ",
            base.bright_cyan().bold(),
            group.bright_yellow(),
            format!("[{}]", command_count).bright_black()
        )
    } else {
        format!("{}{}[{}]> ", base, group, command_count)
    }
}
