//! Prompt templates for remote providers.

use kz_core::Task;

use crate::features::TaskCategory;

pub const SYSTEM_PROMPT: &str = "You are a productivity assistant that analyses personal tasks. \
Always answer with a single JSON object and nothing else.";

fn task_block(task: &Task) -> String {
    let priority = task.priority.map(|p| p.as_str()).unwrap_or("none");
    let category = task.category.as_deref().unwrap_or("none");
    let description = match task.description_text().trim() {
        "" => "none",
        d => d,
    };
    format!(
        "Title: {}\nDescription: {description}\nPriority: {priority}\nCategory: {category}",
        task.title
    )
}

pub fn duration_prompt(task: &Task) -> String {
    format!(
        "Estimate how long the following task will take.\n\n{}\n\n\
Respond with JSON: {{\"minutes\": <integer>, \"confidence\": <number between 0 and 1>, \
\"factors\": [<short strings>], \"reasoning\": \"<one sentence>\"}}",
        task_block(task)
    )
}

pub fn category_prompt(task: &Task) -> String {
    let labels: Vec<&str> = TaskCategory::ALL.iter().map(|c| c.as_str()).collect();
    format!(
        "Classify the following task into exactly one of these categories: {}.\n\n{}\n\n\
Respond with JSON: {{\"category\": \"<one of the categories>\", \"confidence\": <number between 0 and 1>, \
\"tags\": [<short strings>], \"reasoning\": \"<one sentence>\"}}",
        labels.join(", "),
        task_block(task)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use kz_core::TaskPriority;

    #[test]
    fn duration_prompt_embeds_task_fields() {
        let task = Task::new(1, "Prepare slides")
            .with_description("Quarterly review")
            .with_priority(TaskPriority::High)
            .with_category("Trabalho");
        let prompt = duration_prompt(&task);
        assert!(prompt.contains("Title: Prepare slides"));
        assert!(prompt.contains("Description: Quarterly review"));
        assert!(prompt.contains("Priority: high"));
        assert!(prompt.contains("Category: Trabalho"));
        assert!(prompt.contains("\"minutes\""));
    }

    #[test]
    fn category_prompt_lists_every_bucket() {
        let prompt = category_prompt(&Task::new(1, "Buy groceries"));
        for c in TaskCategory::ALL {
            assert!(prompt.contains(c.as_str()));
        }
        assert!(prompt.contains("Description: none"));
        assert!(prompt.contains("\"category\""));
    }
}
