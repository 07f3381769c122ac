use crate::error::{Error, Result};

/// Detected or overridden CSV flavour. `newline` is whichever of `\n`/`\r`
/// appears first at a line end; `has_newline` distinguishes the single-line
/// case, which otherwise looks like one enormous record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dialect {
    pub separator: u8,
    pub quote: u8,
    pub newline: u8,
    pub has_newline: bool,
}

const SNIFF_SIZE: usize = 4000;

/// Sniffs separator, quote, and newline from the head of the input.
/// Separator counting stops at the first newline so only the header/content
/// line votes; tab beats comma when more frequent, pipe and semicolon beat
/// comma only when strictly more frequent. A single quote becomes the quote
/// character only if it balances every sampled line with a consistent
/// column count.
pub fn detect(buf: &[u8], separator_override: Option<u8>, quote_override: Option<u8>) -> Dialect {
    let sample = &buf[..buf.len().min(SNIFF_SIZE)];

    let mut newline = b'\n';
    let mut has_newline = false;
    let mut has_single_quote = false;
    let mut quote = b'"';
    let (mut commas, mut tabs, mut pipes, mut semicolons) = (0u32, 0u32, 0u32, 0u32);

    for &c in sample {
        match c {
            b'\r' => {
                newline = b'\r';
                has_newline = true;
            }
            b'\n' => has_newline = true,
            b'\'' => {
                if !has_single_quote {
                    quote = b'\'';
                    has_single_quote = true;
                }
            }
            b',' if !has_newline => commas += 1,
            b'\t' if !has_newline => tabs += 1,
            b'|' if !has_newline => pipes += 1,
            b';' if !has_newline => semicolons += 1,
            _ => {}
        }
    }

    let mut separator = b',';
    if tabs > 0 && tabs > commas {
        separator = b'\t';
        log::debug!("csv: auto detected tab separator");
    } else if pipes > commas {
        separator = b'|';
        log::debug!("csv: auto detected '|' separator");
    } else if semicolons > commas {
        separator = b';';
        log::debug!("csv: auto detected ';' separator");
    }

    if has_newline && has_single_quote && !single_quote_balances(sample, buf.len(), separator) {
        quote = b'"';
    }

    Dialect {
        separator: separator_override.unwrap_or(separator),
        quote: quote_override.unwrap_or(quote),
        newline,
        has_newline,
    }
}

fn single_quote_balances(sample: &[u8], full_len: usize, separator: u8) -> bool {
    let mut columns = 0usize;
    let mut pos = 0usize;
    loop {
        let (start, end, next) = match next_record(sample, pos, b'\n', b'\'') {
            Ok(Some(range)) => range,
            Ok(None) => break,
            // A quote left open across the sample cannot be the quote char.
            Err(_) => return false,
        };
        pos = next;
        // The sample may cut the last line short; do not let it vote.
        if sample.len() < full_len && next >= sample.len() {
            break;
        }
        let line = &sample[start..end];
        if line.is_empty() {
            continue;
        }
        if line.iter().filter(|&&c| c == b'\'').count() % 2 != 0 {
            return false;
        }
        let fields = match split_record(line, separator, b'\'') {
            Ok(fields) => fields,
            Err(_) => return false,
        };
        if columns > 0 && columns != fields.len() {
            return false;
        }
        columns = fields.len();
    }
    true
}

/// Extracts the next logical record starting at `pos`, honouring quoting:
/// separators and newlines inside quotes are literal, and a doubled quote
/// inside a quoted field is one literal quote. Returns the record's byte
/// range plus the scan position for the following record, or `None` at end
/// of input. An unterminated quote at end of file is structural.
pub fn next_record(
    buf: &[u8],
    mut pos: usize,
    newline: u8,
    quote: u8,
) -> Result<Option<(usize, usize, usize)>> {
    while pos < buf.len() && (buf[pos] == b'\n' || buf[pos] == b'\r') {
        pos += 1;
    }
    if pos >= buf.len() {
        return Ok(None);
    }
    let start = pos;
    let mut in_quotes = false;
    while pos < buf.len() {
        let c = buf[pos];
        if c == quote {
            if in_quotes && pos + 1 < buf.len() && buf[pos + 1] == quote {
                pos += 2;
                continue;
            }
            in_quotes = !in_quotes;
        } else if !in_quotes && (c == newline || c == b'\n') {
            return Ok(Some((start, pos, pos + 1)));
        }
        pos += 1;
    }
    if in_quotes {
        return Err(Error::MalformedFile(
            "unterminated quoted field at end of file".into(),
        ));
    }
    Ok(Some((start, buf.len(), buf.len())))
}

/// Splits one record into its fields. Unquoted fields are trimmed of
/// surrounding whitespace; quoted content is preserved.
pub fn split_record(record: &[u8], separator: u8, quote: u8) -> Result<Vec<Vec<u8>>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .delimiter(separator)
        .quote(quote)
        .double_quote(true)
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(record);
    let mut row = csv::ByteRecord::new();
    match reader.read_byte_record(&mut row) {
        Ok(true) => Ok(row.iter().map(|field| field.to_vec()).collect()),
        Ok(false) => Ok(Vec::new()),
        Err(err) => Err(Error::MalformedFile(format!(
            "failed to parse record: {err}"
        ))),
    }
}
