//! Argument canonicalization, validation, and placeholder substitution.

use crate::domain::{MakerError, Result, ValidationErrorKind};

/// AWS CLI services the executor knows how to drive.
pub const KNOWN_SERVICES: &[&str] = &[
    "acm",
    "apigateway",
    "apigatewayv2",
    "application-autoscaling",
    "athena",
    "autoscaling",
    "batch",
    "bedrock",
    "cloudformation",
    "cloudfront",
    "cloudwatch",
    "cognito-idp",
    "dynamodb",
    "ec2",
    "ecr",
    "ecs",
    "efs",
    "eks",
    "elbv2",
    "events",
    "glue",
    "iam",
    "kafka",
    "kinesis",
    "kms",
    "lambda",
    "logs",
    "opensearch",
    "pipes",
    "rds",
    "resourcegroupstaggingapi",
    "route53",
    "s3",
    "s3api",
    "sagemaker",
    "scheduler",
    "secretsmanager",
    "sns",
    "sqs",
    "ssm",
    "sts",
    "wafv2",
];

/// Tools a plan must never smuggle in as the leading token.
const FOREIGN_BINARIES: &[&str] = &[
    "aws", "az", "bash", "curl", "docker", "eksctl", "git", "helm", "kubectl", "node", "npm",
    "perl", "powershell", "python", "python3", "ruby", "sh", "ssh", "terraform", "wget", "zsh",
];

/// Verb fragments that mutate destructively. Tokens containing any of these
/// are rejected unless destroyer mode is on; matching is deliberately broad.
pub const DESTRUCTIVE_VERBS: &[&str] = &[
    "delete-",
    "remove-",
    "destroy-",
    "detach-",
    "disassociate-",
    "revoke-",
    "terminate-",
];

/// Whether an operation token is destructive (includes the s3 `rb` form).
pub fn is_destructive_token(token: &str) -> bool {
    if token == "rb" {
        return true;
    }
    DESTRUCTIVE_VERBS.iter().any(|verb| token.contains(verb))
}

/// Whether the operation is a removal-flavored verb for idempotency checks.
pub fn is_delete_like_op(op: &str) -> bool {
    op.starts_with("delete-")
        || op.starts_with("remove-")
        || op.starts_with("detach-")
        || op.starts_with("disassociate-")
        || op == "rb"
}

/// Canonicalize an argument vector.
///
/// Trims whitespace, drops empty tokens, and folds `--flag=value` into two
/// tokens so later flag lookups are uniform. Values that merely contain `=`
/// (JSON, `subnetIds=...` shorthand) are only split on the first `=` when the
/// left side looks like a flag name.
pub fn normalize_args(args: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len());
    for raw in args {
        let token = raw.trim();
        if token.is_empty() {
            continue;
        }
        if let Some((flag, value)) = split_flag_equals(token) {
            out.push(flag.to_string());
            out.push(value.to_string());
        } else {
            out.push(token.to_string());
        }
    }
    out
}

fn split_flag_equals(token: &str) -> Option<(&str, &str)> {
    if !token.starts_with("--") {
        return None;
    }
    let eq = token.find('=')?;
    let flag = &token[..eq];
    // Only fold when the left side is a plain flag name.
    if flag.len() > 2
        && flag[2..]
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
    {
        Some((flag, &token[eq + 1..]))
    } else {
        None
    }
}

/// Validate a normalized AWS command before spawning.
///
/// Violations are reported as kinds; tests dispatch on the kind, never the
/// message.
pub fn validate_command(args: &[String], destroyer: bool) -> Result<()> {
    if args.len() < 2 {
        return Err(MakerError::ValidationRejected {
            kind: ValidationErrorKind::EmptyCommand,
            detail: args.join(" "),
        });
    }

    let service = args[0].as_str();
    if FOREIGN_BINARIES.contains(&service) {
        return Err(MakerError::ValidationRejected {
            kind: ValidationErrorKind::ForeignBinary,
            detail: service.to_string(),
        });
    }
    if !KNOWN_SERVICES.contains(&service) {
        return Err(MakerError::ValidationRejected {
            kind: ValidationErrorKind::UnknownService,
            detail: service.to_string(),
        });
    }

    for arg in args {
        if arg.contains(';') || arg.contains('|') || arg.contains("&&") {
            return Err(MakerError::ValidationRejected {
                kind: ValidationErrorKind::ShellOperator,
                detail: arg.clone(),
            });
        }
    }

    if !destroyer {
        for arg in args {
            if is_destructive_token(arg) {
                return Err(MakerError::ValidationRejected {
                    kind: ValidationErrorKind::DestructiveVerb,
                    detail: arg.clone(),
                });
            }
        }
    }

    Ok(())
}

/// Substitute `<NAME>` tokens with bound values, inside tokens as well as
/// for whole tokens.
pub fn apply_plan_bindings(args: &[String], bindings: &crate::BindingStore) -> Vec<String> {
    args.iter()
        .map(|arg| {
            let mut out = arg.clone();
            for (name, value) in bindings.snapshot() {
                let token = format!("<{name}>");
                if out.contains(&token) {
                    out = out.replace(&token, &value);
                }
            }
            out
        })
        .collect()
}

/// Placeholder names still present in the args, `<USER_DATA>` included.
pub fn unresolved_placeholders(args: &[String]) -> Vec<String> {
    let mut found = Vec::new();
    for arg in args {
        let bytes = arg.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'<' {
                if let Some(end) = arg[i + 1..].find('>') {
                    let name = &arg[i + 1..i + 1 + end];
                    if is_placeholder_name(name) {
                        let token = format!("<{name}>");
                        if !found.contains(&token) {
                            found.push(token);
                        }
                    }
                    i += end + 2;
                    continue;
                }
            }
            i += 1;
        }
    }
    found
}

/// True iff any placeholder other than `<USER_DATA>` remains.
///
/// `<USER_DATA>` has a dedicated generator and is the only placeholder
/// allowed to reach the CLI layer.
pub fn has_unresolved_placeholders(args: &[String]) -> bool {
    unresolved_placeholders(args)
        .iter()
        .any(|p| p != "<USER_DATA>")
}

fn is_placeholder_name(name: &str) -> bool {
    !name.is_empty()
        && name.chars().next().is_some_and(|c| c.is_ascii_uppercase())
        && name
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

/// Value of a `--flag` in a normalized argv.
pub fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

/// Replace the value following `--flag`, appending the pair when absent.
pub fn set_flag_value(args: &mut Vec<String>, flag: &str, value: &str) {
    if let Some(i) = args.iter().position(|a| a == flag) {
        if i + 1 < args.len() {
            args[i + 1] = value.to_string();
            return;
        }
    }
    args.push(flag.to_string());
    args.push(value.to_string());
}
