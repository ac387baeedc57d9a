//! Sign-in email composition.

use crate::mail::MagicLinkEmail;

fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Build the plain-text and HTML bodies for a magic link.
pub fn compose_magic_link(to: &str, link: &str, valid_minutes: i64, firm_name: &str) -> MagicLinkEmail {
    let subject = format!("Your {} client portal sign-in link", firm_name);

    let text = format!(
        "Hello,\n\n\
         Use the link below to sign in to the {firm} client portal:\n\n\
         {link}\n\n\
         This link expires in {minutes} minutes and can only be used once.\n\
         If you did not request it, you can ignore this email.\n\n\
         {firm}\n",
        firm = firm_name,
        link = link,
        minutes = valid_minutes,
    );

    let firm = escape_html(firm_name);
    let href = escape_html(link);
    let html = format!(
        r#"<!DOCTYPE html>
<html>
<body style="margin:0;padding:0;background:#f4f6fb;font-family:Inter,-apple-system,BlinkMacSystemFont,sans-serif;">
  <table role="presentation" width="100%" cellpadding="0" cellspacing="0">
    <tr><td align="center" style="padding:32px 16px;">
      <table role="presentation" width="480" cellpadding="0" cellspacing="0" style="background:#ffffff;border-radius:16px;padding:32px;">
        <tr><td style="color:#1a2744;font-size:20px;font-weight:700;padding-bottom:8px;">{firm}</td></tr>
        <tr><td style="color:#333333;font-size:15px;line-height:1.5;padding-bottom:24px;">Click the button below to sign in to your client portal.</td></tr>
        <tr><td align="center" style="padding-bottom:24px;">
          <a href="{href}" style="display:inline-block;background:#1a2744;color:#ffffff;text-decoration:none;font-weight:600;padding:12px 28px;border-radius:8px;">Sign in to the portal</a>
        </td></tr>
        <tr><td style="color:#86868b;font-size:13px;line-height:1.5;">This link expires in {minutes} minutes and can only be used once. If you did not request it, you can ignore this email.</td></tr>
        <tr><td style="color:#86868b;font-size:12px;padding-top:16px;word-break:break-all;">{href}</td></tr>
      </table>
    </td></tr>
  </table>
</body>
</html>
"#,
        firm = firm,
        href = href,
        minutes = valid_minutes,
    );

    MagicLinkEmail {
        to: to.to_string(),
        subject,
        text,
        html,
        link: link.to_string(),
    }
}
