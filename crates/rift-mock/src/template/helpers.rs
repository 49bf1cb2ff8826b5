//! Handlebars helpers: fake data, time and case transforms.
//!
//! Every random helper draws from [`crate::random`].

use crate::random::with_rng;
use chrono::format::{Item, StrftimeItems};
use chrono::Utc;
use fake::faker::address::en::{BuildingNumber, CityName, CountryName, StreetName, ZipCode};
use fake::faker::company::en::{CompanyName, Industry};
use fake::faker::internet::en::{IPv4, SafeEmail, Username};
use fake::faker::name::en::{FirstName, LastName, Name};
use fake::uuid::UUIDv4;
use fake::Fake;
use handlebars::{
    Context, Handlebars, Helper, HelperResult, Output, RenderContext, RenderErrorReason,
};
use rand::distributions::Alphanumeric;
use rand::Rng;

pub fn register(handlebars: &mut Handlebars<'static>) {
    handlebars.register_helper("uuid", Box::new(uuid_helper));
    handlebars.register_helper("randomString", Box::new(random_string_helper));
    handlebars.register_helper("randomInt", Box::new(random_int_helper));
    handlebars.register_helper("randomFloat", Box::new(random_float_helper));
    handlebars.register_helper("randomBool", Box::new(random_bool_helper));
    handlebars.register_helper("firstName", Box::new(first_name_helper));
    handlebars.register_helper("lastName", Box::new(last_name_helper));
    handlebars.register_helper("fullName", Box::new(full_name_helper));
    handlebars.register_helper("city", Box::new(city_helper));
    handlebars.register_helper("country", Box::new(country_helper));
    handlebars.register_helper("streetAddress", Box::new(street_address_helper));
    handlebars.register_helper("zipCode", Box::new(zip_code_helper));
    handlebars.register_helper("companyName", Box::new(company_name_helper));
    handlebars.register_helper("industry", Box::new(industry_helper));
    handlebars.register_helper("email", Box::new(email_helper));
    handlebars.register_helper("username", Box::new(username_helper));
    handlebars.register_helper("ipv4", Box::new(ipv4_helper));
    handlebars.register_helper("now", Box::new(now_helper));
    handlebars.register_helper("upper", Box::new(upper_helper));
    handlebars.register_helper("lower", Box::new(lower_helper));
    handlebars.register_helper("title", Box::new(title_helper));
    handlebars.register_helper("snake", Box::new(snake_helper));
    handlebars.register_helper("camel", Box::new(camel_helper));
}

fn int_param(h: &Helper, index: usize) -> Option<i64> {
    h.param(index).and_then(|v| {
        let value = v.value();
        value
            .as_i64()
            .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
    })
}

fn float_param(h: &Helper, index: usize) -> Option<f64> {
    h.param(index).and_then(|v| {
        let value = v.value();
        value
            .as_f64()
            .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
    })
}

fn str_param(h: &Helper, index: usize) -> String {
    h.param(index)
        .map(|v| match v.value() {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Null => String::new(),
            other => other.to_string(),
        })
        .unwrap_or_default()
}

fn uuid_helper(
    _: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let id: uuid::Uuid = with_rng(|rng| UUIDv4.fake_with_rng(rng));
    out.write(&id.to_string())?;
    Ok(())
}

fn random_string_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let len = int_param(h, 0).unwrap_or(16).clamp(0, 4096) as usize;
    let value: String = with_rng(|rng| {
        rng.sample_iter(&Alphanumeric)
            .take(len)
            .map(char::from)
            .collect()
    });
    out.write(&value)?;
    Ok(())
}

fn random_int_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let min = int_param(h, 0).unwrap_or(0);
    let max = int_param(h, 1).unwrap_or(100).max(min);
    let value = with_rng(|rng| rng.gen_range(min..=max));
    out.write(&value.to_string())?;
    Ok(())
}

fn random_float_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let min = float_param(h, 0).unwrap_or(0.0);
    let max = float_param(h, 1).unwrap_or(1.0).max(min);
    let value = if max > min {
        with_rng(|rng| rng.gen_range(min..max))
    } else {
        min
    };
    out.write(&format!("{value:.2}"))?;
    Ok(())
}

fn random_bool_helper(
    _: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let value: bool = with_rng(|rng| rng.gen());
    out.write(if value { "true" } else { "false" })?;
    Ok(())
}

macro_rules! faker_helper {
    ($name:ident, $faker:expr) => {
        fn $name(
            _: &Helper,
            _: &Handlebars,
            _: &Context,
            _: &mut RenderContext,
            out: &mut dyn Output,
        ) -> HelperResult {
            let value: String = with_rng(|rng| $faker.fake_with_rng(rng));
            out.write(&value)?;
            Ok(())
        }
    };
}

faker_helper!(first_name_helper, FirstName());
faker_helper!(last_name_helper, LastName());
faker_helper!(full_name_helper, Name());
faker_helper!(city_helper, CityName());
faker_helper!(country_helper, CountryName());
faker_helper!(zip_code_helper, ZipCode());
faker_helper!(company_name_helper, CompanyName());
faker_helper!(industry_helper, Industry());
faker_helper!(email_helper, SafeEmail());
faker_helper!(username_helper, Username());
faker_helper!(ipv4_helper, IPv4());

fn street_address_helper(
    _: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let (number, street): (String, String) = with_rng(|rng| {
        (
            BuildingNumber().fake_with_rng(rng),
            StreetName().fake_with_rng(rng),
        )
    });
    out.write(&format!("{number} {street}"))?;
    Ok(())
}

/// `{{now}}`, `{{now "unix"}}`, `{{now "unix_ms"}}`, `{{now "rfc2822"}}`,
/// `{{now "date"}}` or any strftime pattern.
fn now_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let now = Utc::now();
    let format = h.param(0).and_then(|v| v.value().as_str()).unwrap_or("iso");
    let value = match format {
        "iso" | "rfc3339" => now.to_rfc3339(),
        "unix" => now.timestamp().to_string(),
        "unix_ms" => now.timestamp_millis().to_string(),
        "rfc2822" => now.to_rfc2822(),
        "date" => now.format("%Y-%m-%d").to_string(),
        "time" => now.format("%H:%M:%S").to_string(),
        pattern => {
            if StrftimeItems::new(pattern).any(|item| matches!(item, Item::Error)) {
                return Err(RenderErrorReason::Other(format!(
                    "invalid date format '{pattern}'"
                ))
                .into());
            }
            now.format(pattern).to_string()
        }
    };
    out.write(&value)?;
    Ok(())
}

fn upper_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    out.write(&str_param(h, 0).to_uppercase())?;
    Ok(())
}

fn lower_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    out.write(&str_param(h, 0).to_lowercase())?;
    Ok(())
}

fn title_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let titled = words(&str_param(h, 0))
        .iter()
        .map(|w| capitalize(w))
        .collect::<Vec<_>>()
        .join(" ");
    out.write(&titled)?;
    Ok(())
}

fn snake_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let snake = words(&str_param(h, 0))
        .iter()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join("_");
    out.write(&snake)?;
    Ok(())
}

fn camel_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let camel: String = words(&str_param(h, 0))
        .iter()
        .enumerate()
        .map(|(i, w)| if i == 0 { w.to_lowercase() } else { capitalize(w) })
        .collect();
    out.write(&camel)?;
    Ok(())
}

/// Split on whitespace, `_`, `-` and lower-to-upper case boundaries.
fn words(input: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;
    for c in input.chars() {
        if c.is_whitespace() || c == '_' || c == '-' {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            prev_lower = false;
            continue;
        }
        if c.is_uppercase() && prev_lower && !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
        prev_lower = c.is_lowercase() || c.is_ascii_digit();
        current.push(c);
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_words() {
        assert_eq!(words("hello world"), vec!["hello", "world"]);
        assert_eq!(words("helloWorld"), vec!["hello", "World"]);
        assert_eq!(words("order_id-value"), vec!["order", "id", "value"]);
    }

    #[test]
    fn test_capitalize() {
        assert_eq!(capitalize("rIFT"), "Rift");
        assert_eq!(capitalize(""), "");
    }
}
