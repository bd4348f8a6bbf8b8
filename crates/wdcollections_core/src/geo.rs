//! Coordinate notations found in query results and wiki templates.
//!
//! Stored coordinates use `lat|lon|alt` with five decimals and a zero altitude.
//! Free-form template values are first normalized to a `/`-delimited form
//! (`48°51′29″N` becomes `48/51/29/N`) and parsed from there.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axis {
    Latitude,
    Longitude,
}

pub fn format_coordinates(latitude: f64, longitude: f64) -> String {
    format!("{latitude:.5}|{longitude:.5}|0")
}

/// `Point(lon lat)` as returned by the query service.
pub fn parse_wkt_point(value: &str) -> Option<(f64, f64)> {
    let trimmed = value.trim();
    let open = trimmed.find('(')?;
    let close = trimmed.rfind(')')?;
    if close <= open || !trimmed[..open].trim().eq_ignore_ascii_case("point") {
        return None;
    }
    let mut numbers = trimmed[open + 1..close].split_whitespace();
    let longitude = numbers.next()?.parse::<f64>().ok()?;
    let latitude = numbers.next()?.parse::<f64>().ok()?;
    in_range(latitude, longitude)
}

/// Strip whitespace and unify degree/minute/second marks to a single `/`.
pub fn normalize_free_form(value: &str) -> String {
    let mut output = String::with_capacity(value.len());
    for ch in value.chars() {
        if ch.is_whitespace() {
            continue;
        }
        let mapped = match ch {
            '°' | 'º' | '′' | '″' | '\'' | '"' | '’' | '‘' | '”' | '“' | '´' | '`' => '/',
            other => other,
        };
        if mapped == '/' && output.ends_with('/') {
            continue;
        }
        output.push(mapped);
    }
    output
}

/// One latitude or longitude in decimal (`48.858`, `-2,5`) or degree/minute/second
/// notation with an optional hemisphere (`40/26/46/N`, `2°17′40″E`).
pub fn parse_component(value: &str) -> Option<f64> {
    parse_axis_component(value).map(|(number, _)| number)
}

/// Combine two halves into the stored form; `None` unless both parse and lie in range.
pub fn combine_halves(latitude: &str, longitude: &str) -> Option<String> {
    let (latitude, lat_axis) = parse_axis_component(latitude)?;
    let (longitude, lon_axis) = parse_axis_component(longitude)?;
    if lat_axis == Some(Axis::Longitude) || lon_axis == Some(Axis::Latitude) {
        return None;
    }
    in_range(latitude, longitude).map(|(lat, lon)| format_coordinates(lat, lon))
}

/// Parse any stored or harvested coordinate text into `(latitude, longitude)`.
pub fn parse_coordinates(value: &str) -> Option<(f64, f64)> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.contains('|') {
        let mut parts = trimmed.split('|');
        let latitude = parse_component(parts.next()?)?;
        let longitude = parse_component(parts.next()?)?;
        return in_range(latitude, longitude);
    }
    if let Some(point) = parse_wkt_point(trimmed) {
        return Some(point);
    }

    let words = trimmed.split_whitespace().collect::<Vec<_>>();
    if words.len() == 2
        && let Some(latitude) = parse_decimal(words[0])
        && let Some(longitude) = parse_decimal(words[1])
    {
        return in_range(latitude, longitude);
    }

    let normalized = normalize_free_form(trimmed);
    for separator in [';', ','] {
        if let Some((left, right)) = normalized.split_once(separator)
            && !right.contains(separator)
            && let Some(latitude) = parse_component(left)
            && let Some(longitude) = parse_component(right)
        {
            return in_range(latitude, longitude);
        }
    }

    coordinates_from_parts(&tokens(&normalized))
}

/// Assemble coordinates from the positional parameters of a coordinate template:
/// `deg|min|sec|N|deg|min|sec|E`, the shorter `deg|min|N|…` and `deg|N|…` forms, or
/// two plain decimals.
pub fn coordinates_from_parts(parts: &[String]) -> Option<(f64, f64)> {
    let parts = parts
        .iter()
        .map(|part| part.trim())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>();

    let lat_end = parts
        .iter()
        .position(|part| hemisphere(part).is_some_and(|(axis, _)| axis == Axis::Latitude));
    let Some(lat_end) = lat_end else {
        if parts.len() >= 2 {
            let latitude = parse_decimal(parts[0])?;
            let longitude = parse_decimal(parts[1])?;
            return in_range(latitude, longitude);
        }
        return None;
    };

    let lon_end = lat_end
        + 1
        + parts[lat_end + 1..]
            .iter()
            .position(|part| hemisphere(part).is_some_and(|(axis, _)| axis == Axis::Longitude))?;

    let latitude = assemble(&parts[..lat_end], parts[lat_end])?;
    let longitude = assemble(&parts[lat_end + 1..lon_end], parts[lon_end])?;
    in_range(latitude, longitude)
}

fn parse_axis_component(value: &str) -> Option<(f64, Option<Axis>)> {
    let parts = tokens(value);
    let (last, numbers) = parts.split_last()?;
    match hemisphere(last) {
        Some((axis, sign)) => {
            let numbers = numbers.iter().map(String::as_str).collect::<Vec<_>>();
            assemble_numbers(&numbers).map(|number| (number * sign, Some(axis)))
        }
        None => {
            let numbers = parts.iter().map(String::as_str).collect::<Vec<_>>();
            assemble_numbers(&numbers).map(|number| (number, None))
        }
    }
}

/// Normalized `/`-delimited pieces, with letters split from digits so that glued
/// hemispheres (`29N`, `N2`) become separate tokens.
fn tokens(value: &str) -> Vec<String> {
    let normalized = normalize_free_form(value);
    let mut output = Vec::new();
    for part in normalized.split('/') {
        let mut current = String::new();
        let mut current_alpha = None;
        for ch in part.chars() {
            let alpha = ch.is_alphabetic();
            if current_alpha.is_some_and(|previous| previous != alpha) {
                output.push(std::mem::take(&mut current));
            }
            current_alpha = Some(alpha);
            current.push(ch);
        }
        if !current.is_empty() {
            output.push(current);
        }
    }
    output
}

fn assemble(numbers: &[&str], hemisphere_token: &str) -> Option<f64> {
    let (_, sign) = hemisphere(hemisphere_token)?;
    assemble_numbers(numbers).map(|value| value * sign)
}

fn assemble_numbers(numbers: &[&str]) -> Option<f64> {
    if numbers.is_empty() || numbers.len() > 3 {
        return None;
    }
    let mut values = Vec::with_capacity(numbers.len());
    for number in numbers {
        values.push(parse_decimal(number)?);
    }
    let degrees = values[0];
    let minutes = values.get(1).copied().unwrap_or(0.0);
    let seconds = values.get(2).copied().unwrap_or(0.0);
    if !(0.0..60.0).contains(&minutes) || !(0.0..60.0).contains(&seconds) {
        return None;
    }
    let magnitude = degrees.abs() + minutes / 60.0 + seconds / 3600.0;
    Some(if degrees.is_sign_negative() { -magnitude } else { magnitude })
}

fn parse_decimal(value: &str) -> Option<f64> {
    let trimmed = value.trim().trim_start_matches('+');
    let candidate = if trimmed.contains(',') && !trimmed.contains('.') {
        trimmed.replacen(',', ".", 1)
    } else {
        trimmed.to_string()
    };
    if candidate.is_empty()
        || !candidate
            .chars()
            .all(|ch| ch.is_ascii_digit() || ch == '.' || ch == '-')
    {
        return None;
    }
    candidate.parse::<f64>().ok().filter(|number| number.is_finite())
}

fn hemisphere(token: &str) -> Option<(Axis, f64)> {
    match token.trim().to_ascii_uppercase().as_str() {
        "N" => Some((Axis::Latitude, 1.0)),
        "S" => Some((Axis::Latitude, -1.0)),
        "E" => Some((Axis::Longitude, 1.0)),
        // French and Spanish templates write west as `O`.
        "W" | "O" => Some((Axis::Longitude, -1.0)),
        _ => None,
    }
}

fn in_range(latitude: f64, longitude: f64) -> Option<(f64, f64)> {
    if (-90.0..=90.0).contains(&latitude) && (-180.0..=180.0).contains(&longitude) {
        Some((latitude, longitude))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::{
        combine_halves, coordinates_from_parts, format_coordinates, normalize_free_form,
        parse_component, parse_coordinates, parse_wkt_point,
    };

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn dms_halves_round_trip_to_decimal() {
        assert_eq!(
            combine_halves("40/26/46/N", "79/58/56/W").as_deref(),
            Some("40.44611|-79.98222|0")
        );
        let latitude = parse_component("40/26/46/N").expect("latitude");
        let longitude = parse_component("79/58/56/W").expect("longitude");
        assert!((latitude - 40.44611).abs() < 1e-4);
        assert!((longitude + 79.98222).abs() < 1e-4);
    }

    #[test]
    fn free_form_marks_collapse_to_slashes() {
        assert_eq!(normalize_free_form("48° 51′ 29″ N"), "48/51/29/N");
        assert_eq!(normalize_free_form("2°17'40\"E"), "2/17/40/E");
        assert_eq!(normalize_free_form("12''"), "12/");
    }

    #[test]
    fn positional_template_parts_assemble_eight_part_form() {
        let (latitude, longitude) =
            coordinates_from_parts(&strings(&["48", "51", "29", "N", "2", "17", "40", "E"]))
                .expect("coordinates");
        assert_eq!(format_coordinates(latitude, longitude), "48.85806|2.29444|0");
    }

    #[test]
    fn positional_template_parts_accept_short_and_decimal_forms() {
        let (latitude, longitude) =
            coordinates_from_parts(&strings(&["43.6", "S", "172.5", "O"])).expect("coordinates");
        assert!((latitude + 43.6).abs() < 1e-9);
        assert!((longitude + 172.5).abs() < 1e-9);

        let (latitude, longitude) =
            coordinates_from_parts(&strings(&["48.858", "2.294"])).expect("decimal");
        assert!((latitude - 48.858).abs() < 1e-9);
        assert!((longitude - 2.294).abs() < 1e-9);

        assert!(coordinates_from_parts(&strings(&["48", "51", "N"])).is_none());
    }

    #[test]
    fn parse_coordinates_accepts_stored_and_free_form_values() {
        let (latitude, longitude) = parse_coordinates("48.85806|2.29444|0").expect("stored");
        assert!((latitude - 48.85806).abs() < 1e-9);
        assert!((longitude - 2.29444).abs() < 1e-9);

        let (latitude, longitude) =
            parse_coordinates("48°51′29″N 2°17′40″E").expect("free-form dms");
        assert!((latitude - 48.85806).abs() < 1e-4);
        assert!((longitude - 2.29444).abs() < 1e-4);

        let (latitude, longitude) = parse_coordinates("48.858, 2.294").expect("decimal pair");
        assert!((latitude - 48.858).abs() < 1e-9);
        assert!((longitude - 2.294).abs() < 1e-9);

        assert!(parse_coordinates("somewhere in Paris").is_none());
        assert!(parse_coordinates("95|10|0").is_none());
    }

    #[test]
    fn glued_hemisphere_and_comma_decimals_parse() {
        let latitude = parse_component("29N").expect("glued");
        assert!((latitude - 29.0).abs() < 1e-9);
        let longitude = parse_component("2,5").expect("comma decimal");
        assert!((longitude - 2.5).abs() < 1e-9);
        assert!(parse_component("40/75/N").is_none());
    }

    #[test]
    fn wkt_point_is_longitude_first() {
        assert_eq!(parse_wkt_point("Point(2.294 48.858)"), Some((48.858, 2.294)));
        assert_eq!(parse_wkt_point("Line(1 2)"), None);
    }
}
