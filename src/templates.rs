use minijinja::{context, Environment};

const TICKET_DESCRIPTION_TEMPLATE: &str = include_str!("templates/ticket_description.j2");

pub struct TicketDescriptionContext<'a> {
    pub subject: &'a str,
    pub requester: &'a str,
    pub source_domain: &'a str,
    pub transcript: &'a str,
    pub message_count: usize,
}

pub fn render_ticket_description(ctx: &TicketDescriptionContext<'_>) -> String {
    let mut env = Environment::new();
    if env
        .add_template("ticket_description", TICKET_DESCRIPTION_TEMPLATE)
        .is_err()
    {
        return fallback_ticket_description(ctx);
    }

    let Ok(template) = env.get_template("ticket_description") else {
        return fallback_ticket_description(ctx);
    };

    template
        .render(context! {
            subject => ctx.subject.trim(),
            requester => ctx.requester.trim(),
            source_domain => ctx.source_domain.trim(),
            transcript => ctx.transcript,
            message_count => ctx.message_count,
        })
        .unwrap_or_else(|err| {
            tracing::warn!(error = %err, "ticket description template failed to render");
            fallback_ticket_description(ctx)
        })
}

fn fallback_ticket_description(ctx: &TicketDescriptionContext<'_>) -> String {
    let mut description = format!(
        "Converted from chat conversation \"{}\".\n",
        ctx.subject.trim()
    );
    if !ctx.requester.trim().is_empty() {
        description.push_str(&format!("Requester: {}\n", ctx.requester.trim()));
    }
    if !ctx.source_domain.trim().is_empty() {
        description.push_str(&format!("Source: {}\n", ctx.source_domain.trim()));
    }
    description.push_str("\nTranscript:\n");
    description.push_str(ctx.transcript);
    description
}

pub fn closed_message(staff_name: &str) -> String {
    format!("Conversation closed by {}", display_name(staff_name))
}

pub fn reopened_message(staff_name: &str) -> String {
    format!("Conversation reopened by {}", display_name(staff_name))
}

pub fn converted_message(ticket_number: &str) -> String {
    format!("This conversation was converted to support ticket {ticket_number}")
}

fn display_name(name: &str) -> &str {
    if name.trim().is_empty() {
        "a staff member"
    } else {
        name.trim()
    }
}
