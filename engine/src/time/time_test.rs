use super::*;
use proptest::prelude::*;

#[test]
pub fn numeric_durations() {
    assert_eq!(parse_duration("2.5"), Ok(Duration::from_millis(2500)));
    assert_eq!(parse_duration(" 10 "), Ok(Duration::from_secs(10)));
    assert!(parse_duration("-1").is_err());
    assert!(parse_duration("inf").is_err());
}

#[test]
pub fn oversized_durations_are_invalid() {
    assert!(parse_duration("1e20").is_err());
    assert!(parse_duration("99999999999999999999:00:00").is_err());
    assert!(parse_date("1e30").is_err());
}

#[test]
pub fn unreachable_deadline_means_none() {
    assert_eq!(deadline_after(Some(Duration::MAX)), None);
    assert_eq!(deadline_after(None), None);
    assert!(deadline_after(Some(Duration::from_secs(1))).is_some());
}

#[test]
pub fn clock_durations() {
    assert_eq!(parse_duration("1:02:03"), Ok(Duration::from_secs(3723)));
    assert_eq!(parse_duration("0:00:01.5"), Ok(Duration::from_millis(1500)));
    assert!(parse_duration("1:2").is_err());
    assert!(parse_duration("soon").is_err());
}

#[test]
pub fn numeric_dates() {
    assert_eq!(
        parse_date("1000"),
        Ok(UNIX_EPOCH + Duration::from_secs(1000))
    );
}

#[test]
pub fn calendar_dates_are_local() {
    let parsed = parse_date("2020-02-29 12:30:00.25").unwrap();
    let expected = Local
        .with_ymd_and_hms(2020, 2, 29, 12, 30, 0)
        .earliest()
        .map(|date| SystemTime::from(date) + Duration::from_millis(250))
        .unwrap();

    assert_eq!(parsed, expected);
    assert!(parse_date("2020-02-30 12:30:00").is_err());
}

#[test]
pub fn formatted_durations() {
    assert_eq!(format_duration(Duration::from_secs(4)), "4s");
    assert_eq!(format_duration(Duration::from_millis(62_500)), "1m2.500s");
    assert_eq!(format_duration(Duration::from_secs(86_400 + 3)), "1d0h0m3s");
}

#[test]
pub fn sleep_until_the_later_bound() {
    let timer = Timer::new(Some(Duration::from_secs(60)));
    let slept = sleep(
        Some(Duration::from_millis(10)),
        Some(SystemTime::now() + Duration::from_millis(50)),
    );

    assert!(slept >= Duration::from_millis(40));
    assert!(timer.elapsed() >= Duration::from_millis(40));
    assert!(timer.remaining().unwrap() < Duration::from_secs(60));
}

#[test]
pub fn wait_elapsed_is_relative_to_start() {
    let timer = Timer::default();
    timer.wait_elapsed(Duration::from_millis(30));

    assert!(timer.elapsed() >= Duration::from_millis(30));
    assert_eq!(timer.remaining(), None);
    assert_eq!(timer.wait_elapsed(Duration::from_millis(1)), Duration::ZERO);
}

proptest! {
    #[test]
    fn clock_and_seconds_agree(hours in 0u64..100, minutes in 0u64..60, seconds in 0u64..60) {
        let clock = format!("{hours}:{minutes:02}:{seconds:02}");
        let total = (hours * 3600 + minutes * 60 + seconds).to_string();

        prop_assert_eq!(parse_duration(&clock).unwrap(), parse_duration(&total).unwrap());
    }
}
