use serde_json::{Value, json};

/// The static tool declaration sent with every model request.
pub fn tool_schema() -> Value {
    json!([
        {
            "type": "function",
            "function": {
                "name": "click",
                "description": "Clicks selected element, wait until navigation/interaction ends and returns the resulting HTML",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "selector": { "type": "string", "description": "HTML selector of element to click" },
                        "reasoning": { "type": "string", "description": "Human readable explanation what and why is clicked for audit purposes" }
                    },
                    "required": ["selector", "reasoning"]
                }
            }
        },
        {
            "type": "function",
            "function": {
                "name": "type",
                "description": "Type text into an input field",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "selector": { "type": "string", "description": "HTML selector of the input to type into" },
                        "value": { "type": "string", "description": "value to fill" },
                        "reasoning": { "type": "string", "description": "Human readable explanation what and why is typed for audit purposes" }
                    },
                    "required": ["selector", "value", "reasoning"]
                }
            }
        },
        {
            "type": "function",
            "function": {
                "name": "select",
                "description": "Select an option from a dropdown menu",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "selector": { "type": "string", "description": "HTML selector of the dropdown" },
                        "value": { "type": "string", "description": "option to select" },
                        "reasoning": { "type": "string", "description": "Human readable explanation what and why is selected for audit purposes" }
                    },
                    "required": ["selector", "value", "reasoning"]
                }
            }
        }
    ])
}
