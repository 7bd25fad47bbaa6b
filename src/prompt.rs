//! Prompt construction for SQL generation
//!
//! Renders retrieved schema fragments, security rules, and worked examples
//! into the system and user messages sent to the completion model. Output
//! is byte-identical for identical inputs: no timestamps, no randomness.
//! The semantic cache and the prompt tests both rely on that.

use crate::schema_rag::schema::SchemaFragment;
use itertools::Itertools;
use std::collections::BTreeMap;
use std::fmt::Write;

/// Render retrieved fragments into the schema-context section of the
/// system prompt. One section per table (the first fragment seen for a
/// table wins, sections ordered by table name), columns ordered primary
/// keys, then foreign keys, then the rest, preserving original order
/// inside each group.
pub fn build_schema_context(fragments: &[SchemaFragment]) -> String {
    let mut context = String::new();

    context.push_str("Participant Database Schema Context:\n");
    context.push_str("=====================================\n\n");
    context.push_str(
        "This database manages participants in various applications/events with the following structure:\n\n",
    );

    let mut tables: BTreeMap<&str, &SchemaFragment> = BTreeMap::new();
    for fragment in fragments {
        tables.entry(fragment.table_name.as_str()).or_insert(fragment);
    }

    for (table_name, fragment) in &tables {
        let _ = writeln!(context, "Table: {}", table_name);
        let _ = writeln!(context, "{}", "-".repeat(table_name.len() + 7));

        match *table_name {
            "Participant" => context.push_str(
                "Purpose: Stores individual participant information including personal details, contact info, and social media profiles\n",
            ),
            "Participant_ApplicationInstance" => context.push_str(
                "Purpose: Links participants to specific application instances/events, tracks check-in status and platform usage\n",
            ),
            _ => {
                let _ = writeln!(context, "Purpose: {}", fragment.description);
            }
        }

        context.push_str("Columns:\n");

        let mut columns: Vec<_> = fragment.columns.iter().collect();
        columns.sort_by_key(|c| {
            if c.is_primary_key {
                0
            } else if c.is_foreign_key {
                1
            } else {
                2
            }
        });

        for column in columns {
            let mut constraints = Vec::new();
            if column.is_primary_key {
                constraints.push("PK");
            }
            if column.is_foreign_key {
                constraints.push("FK");
            }
            if !column.is_nullable {
                constraints.push("NOT NULL");
            }
            if column.is_identity {
                constraints.push("IDENTITY");
            }

            let constraint_str = if constraints.is_empty() {
                String::new()
            } else {
                format!(" ({})", constraints.iter().join(", "))
            };
            let _ = writeln!(
                context,
                "  - {}: {}{}",
                column.column_name, column.data_type, constraint_str
            );
            let _ = writeln!(context, "    Description: {}", column.description);
            if !column.business_context.is_empty() {
                let _ = writeln!(context, "    Business Context: {}", column.business_context);
            }
            context.push('\n');
        }
        context.push('\n');
    }

    context.push_str("Table Relationships:\n");
    context.push_str("-------------------\n");

    for fragment in fragments {
        for rel in &fragment.relationships {
            let _ = writeln!(
                context,
                "- {}.{} → {}.{} ({})",
                rel.from_table, rel.from_column, rel.to_table, rel.to_column, rel.description
            );
        }
    }
    context.push('\n');

    context.push_str("Common Query Patterns:\n");
    context.push_str("---------------------\n");
    context.push_str("- Use JOINs when querying across both tables\n");
    context.push_str("- Filter by IsDeleted = 0 for active records (if present)\n");
    context.push_str("- Use CheckInStatus for event attendance queries (if present)\n");
    context.push_str("- Platform tracking via JoinedByIOS, JoinedByAndroid, JoinedByPWA columns (if present)\n");
    context.push_str("- Social media queries use LinkedInPublicProfileUrl, etc. (if present)\n");

    context
}

/// Assemble the full system prompt. The mandatory event-join instruction
/// is emitted only when `event_id` is a real event scope (> 0).
pub fn build_system_prompt(schema_context: &str, application_id: i32, event_id: i32) -> String {
    let mut prompt = String::new();

    prompt.push_str(
        "You are an expert SQL developer specializing in participant management systems. \
         Your task is to convert natural language questions into precise, secure, and \
         optimized SQL queries using the provided database schema.\n\n",
    );

    if event_id > 0 {
        let _ = writeln!(
            prompt,
            "IMPORTANT: @EventId = {} is provided and greater than 0. YOU MUST join Participant \
             with Participant_ApplicationInstance ON p.Id = pai.ParticipantId and include \
             pai.ApplicationInstanceId = @EventId in the WHERE clause. This is mandatory for \
             every query.\n",
            event_id
        );
    }

    let _ = writeln!(prompt, "INPUT PARAMETERS:");
    let _ = writeln!(prompt, "    @ApplicationId = {}", application_id);
    let _ = writeln!(prompt, "    @EventId = {}\n", event_id);

    prompt.push_str(
        "CRITICAL SECURITY RULES (MANDATORY):\n\
         1. ONLY generate SELECT statements - absolutely NO INSERT, UPDATE, DELETE, DROP, CREATE, ALTER, TRUNCATE, EXEC, EXECUTE, or any DDL/DML operations.\n\
         2. Never include SQL comments (-- or /* */) to prevent injection attacks.\n\
         3. Use parameterized approaches where possible.\n\
         4. Validate all inputs and use proper escaping.\n\
         5. No dynamic SQL construction or EXEC statements.\n\
         6. No system stored procedures (sp_, xp_) or administrative functions.\n\n",
    );

    prompt.push_str(
        "SQL SERVER SYNTAX REQUIREMENTS:\n\
         1. Use proper SQL Server T-SQL syntax and functions.\n\
         2. Use meaningful table aliases: 'p' for Participant, 'pai' for Participant_ApplicationInstance.\n\
         3. Always use square brackets [TableName] for table names if they contain special characters.\n\
         4. Use ISNULL() or COALESCE() for NULL handling.\n\
         5. Use DATEPART(), YEAR(), MONTH(), DAY() for date operations.\n\
         6. Use LEN() instead of LENGTH() for string length.\n\
         7. Use CHARINDEX() for string searching.\n\
         8. Use TOP N instead of LIMIT for result limiting.\n\n",
    );

    prompt.push_str(
        "PARTICIPANT SYSTEM BUSINESS RULES:\n\
         1. ALWAYS filter out soft-deleted records:\n\
            - Use 'IsDeleted = 0' for Participant table.\n\
            - Use 'isDeleted = 0' for Participant_ApplicationInstance table (note lowercase 'i').\n\
            - Use 'isDeleted = 0' for ApplicationInstance table.\n\
         2. For active participants: WHERE p.IsDeleted = 0.\n\
         3. For active relationships: WHERE pai.isDeleted = 0.\n\
         4. When joining both tables, filter both: WHERE p.IsDeleted = 0 AND pai.isDeleted = 0.\n\
         5. ALWAYS include 'p.ApplicationId = @ApplicationId' in the WHERE clause of every query, regardless of other filters.\n\
         6. Only join Participant_ApplicationInstance and filter on @EventId when an event scope is given; otherwise do NOT join it and do NOT filter on EventId.\n\n",
    );

    prompt.push_str(
        "RESPONSE FORMAT:\n\
         - Return ONLY the SQL query without any explanations, markdown formatting, or additional text.\n\
         - Ensure the query is properly formatted and ready to execute.\n\
         - Use proper indentation and line breaks for readability.\n\
         - End with a semicolon if it's a complete statement.\n\n",
    );

    prompt.push_str("DATABASE SCHEMA CONTEXT:\n");
    prompt.push_str(schema_context);
    prompt.push('\n');

    prompt.push_str(SYSTEM_INSTRUCTIONS);
    prompt.push('\n');

    prompt.push_str("WORKED EXAMPLES:\n");
    for (nl, sql) in WORKED_EXAMPLES {
        let _ = writeln!(prompt, "-- Query: {}", nl);
        let _ = writeln!(prompt, "{}", sql);
        prompt.push('\n');
    }

    prompt.push_str(SAMPLE_EXCHANGE);

    prompt
}

/// Wrap the user's question in the fixed requirement list sent as the user
/// message.
pub fn build_user_prompt(query: &str) -> String {
    format!(
        "Convert this natural language query to SQL:\n\n\
         Query: \"{}\"\n\n\
         Requirements:\n\
         1. Generate a secure SELECT-only query\n\
         2. Follow all participant system business rules\n\
         3. Use proper SQL Server syntax\n\
         4. Include appropriate filtering for soft-deleted records\n\
         5. Use meaningful aliases and proper formatting\n\
         6. Consider performance and include relevant ORDER BY clauses\n\
         7. Handle NULL values appropriately\n\n\
         Return only the SQL query.",
        query
    )
}

const SYSTEM_INSTRUCTIONS: &str = "\
SYSTEM INSTRUCTIONS:\n\
- Interpret participant-facing vocabulary: 'attendees' and 'people' mean rows in Participant; 'the event' means the ApplicationInstance scope.\n\
- Prefer explicit column lists over SELECT * when the question names specific attributes.\n\
- When counting, alias aggregates with descriptive names (e.g. ParticipantCount).\n\
- When the question is ambiguous between participants and their event links, answer at the Participant grain.\n";

const WORKED_EXAMPLES: &[(&str, &str)] = &[
    (
        "List all participants",
        "SELECT TOP 100 p.Id, p.FirstName, p.LastName, p.Email\n\
         FROM Participant p\n\
         WHERE p.IsDeleted = 0 AND p.ApplicationId = @ApplicationId\n\
         ORDER BY p.LastName, p.FirstName",
    ),
    (
        "How many participants have checked in?",
        "SELECT COUNT(DISTINCT p.Id) AS CheckedInCount\n\
         FROM Participant p\n\
         JOIN Participant_ApplicationInstance pai ON p.Id = pai.ParticipantId\n\
         WHERE p.IsDeleted = 0 AND pai.isDeleted = 0\n\
           AND p.ApplicationId = @ApplicationId\n\
           AND pai.CheckInStatus = 1",
    ),
    (
        "Show participants who joined from iOS",
        "SELECT p.Id, p.FirstName, p.LastName, p.Email\n\
         FROM Participant p\n\
         JOIN Participant_ApplicationInstance pai ON p.Id = pai.ParticipantId\n\
         WHERE p.IsDeleted = 0 AND pai.isDeleted = 0\n\
           AND p.ApplicationId = @ApplicationId\n\
           AND pai.JoinedByIOS = 1\n\
         ORDER BY p.LastName",
    ),
];

const SAMPLE_EXCHANGE: &str = "\
EXAMPLE:\n\
Question: \"Which participants have a LinkedIn profile?\"\n\
SQL:\n\
SELECT p.Id, p.FirstName, p.LastName, p.LinkedInPublicProfileUrl\n\
FROM Participant p\n\
WHERE p.IsDeleted = 0\n\
  AND p.ApplicationId = @ApplicationId\n\
  AND p.LinkedInPublicProfileUrl IS NOT NULL\n\
ORDER BY p.LastName;\n";
